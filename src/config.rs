//! Station configuration.
//!
//! Everything is read from one JSON file. Every field has a default, so a
//! file only needs the values that differ from the production station.

use crate::firmware::{FlashAddress, ImageSlot};
use crate::psu::PsuSettings;
use crate::rf::RfSettings;
use crate::sequencer::{SequenceLimits, SequenceTiming};
use crate::session::Variant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no configuration for {0} and no Default entry")]
    MissingVariant(Variant),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfConfig {
    pub vendor: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl Default for RfConfig {
    fn default() -> Self {
        let rf = RfSettings::default();
        Self {
            vendor: rf.vendor,
            baud_rate: rf.baud_rate,
            read_timeout_ms: rf.read_timeout.as_millis() as u64,
        }
    }
}

impl RfConfig {
    pub fn settings(&self) -> RfSettings {
        RfSettings {
            vendor: self.vendor.clone(),
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsuConfig {
    pub host: String,
    pub port: u16,
    pub io_timeout_ms: u64,
    /// Wait after each output change before reading back.
    pub settle_ms: u64,
}

impl Default for PsuConfig {
    fn default() -> Self {
        let psu = PsuSettings::default();
        Self {
            host: psu.host,
            port: psu.port,
            io_timeout_ms: psu.io_timeout.as_millis() as u64,
            settle_ms: 1000,
        }
    }
}

impl PsuConfig {
    pub fn settings(&self) -> PsuSettings {
        PsuSettings {
            host: self.host.clone(),
            port: self.port,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// The radio chip's flashing tool and the images shared by all variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioToolConfig {
    pub program: PathBuf,
    /// Arguments placed before the tool's own, e.g. `["-m", "esptool"]`.
    pub leading_args: Vec<String>,
    /// Substring of the USB description of the programming port.
    pub port_hint: String,
    /// Port used when nothing matches the hint.
    pub fallback_port: String,
    pub baud_rate: u32,
    pub chip: String,
    pub erase_settle_ms: u64,
    /// Delay between the pin changes that put the chip back into run mode.
    pub pin_step_ms: u64,
    pub partition_table: ImageSlot,
    pub ota_data: ImageSlot,
    pub bootloader: ImageSlot,
    pub application_address: FlashAddress,
}

impl Default for RadioToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python"),
            leading_args: vec!["-m".to_string(), "esptool".to_string()],
            port_hint: "USB Serial Port".to_string(),
            fallback_port: String::new(),
            baud_rate: 460_800,
            chip: "esp32".to_string(),
            erase_settle_ms: 5000,
            pin_step_ms: 2000,
            partition_table: ImageSlot::new("esp/partition-table.bin", 0x8000),
            ota_data: ImageSlot::new("esp/ota_data_initial.bin", 0xD000),
            bootloader: ImageSlot::new("esp/bootloader.bin", 0x1000),
            application_address: FlashAddress(0x1_0000),
        }
    }
}

/// The MCU debug-probe CLI and the images shared by all variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McuToolConfig {
    pub cli_path: PathBuf,
    pub frequency_khz: u32,
    pub startup: ImageSlot,
    pub bootloader: ImageSlot,
    pub application_address: FlashAddress,
}

impl Default for McuToolConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("STM32_Programmer_CLI"),
            frequency_khz: 4000,
            startup: ImageSlot::new("stm/startloader.bin", 0x0800_0000),
            bootloader: ImageSlot::new("stm/bootloader.bin", 0x0800_2000),
            application_address: FlashAddress(0x0800_8000),
        }
    }
}

/// Files that differ between variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantAssets {
    pub radio_application: PathBuf,
    pub mcu_application: PathBuf,
    pub eeprom: PathBuf,
}

impl VariantAssets {
    fn named(radio: &str, mcu: &str, eeprom: &str) -> Self {
        Self {
            radio_application: PathBuf::from(radio),
            mcu_application: PathBuf::from(mcu),
            eeprom: PathBuf::from(eeprom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierRules {
    pub unit_prefix: String,
    pub unit_len: usize,
    pub protocol_prefix: String,
    pub protocol_len: usize,
    /// Accept any identifier. Bench use only.
    pub dev_mode: bool,
}

impl Default for IdentifierRules {
    fn default() -> Self {
        Self {
            unit_prefix: "03".to_string(),
            unit_len: 10,
            protocol_prefix: "010H".to_string(),
            protocol_len: 16,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub reset_settle_ms: u64,
    pub apply_settle_ms: u64,
    pub rise_edge_settle_ms: u64,
    pub final_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let t = SequenceTiming::default();
        Self {
            poll_interval_ms: t.poll_interval.as_millis() as u64,
            reset_settle_ms: t.reset_settle.as_millis() as u64,
            apply_settle_ms: t.apply_settle.as_millis() as u64,
            rise_edge_settle_ms: t.rise_edge_settle.as_millis() as u64,
            final_settle_ms: t.final_settle.as_millis() as u64,
        }
    }
}

impl TimingConfig {
    pub fn timing(&self) -> SequenceTiming {
        SequenceTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reset_settle: Duration::from_millis(self.reset_settle_ms),
            apply_settle: Duration::from_millis(self.apply_settle_ms),
            rise_edge_settle: Duration::from_millis(self.rise_edge_settle_ms),
            final_settle: Duration::from_millis(self.final_settle_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Relative image and EEPROM paths are resolved against this directory.
    pub asset_root: PathBuf,
    pub results_dir: PathBuf,
    pub rf: RfConfig,
    pub psu: PsuConfig,
    pub radio: RadioToolConfig,
    pub mcu: McuToolConfig,
    pub variants: BTreeMap<Variant, VariantAssets>,
    pub identifiers: IdentifierRules,
    pub limits: SequenceLimits,
    pub timing: TimingConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        let variants = BTreeMap::from([
            (
                Variant::Gw100,
                VariantAssets::named("esp/gw100.bin", "stm/gw100.bin", "data/data_gw_100.json"),
            ),
            (
                Variant::Fm20,
                VariantAssets::named("esp/fm20.bin", "stm/fm20.bin", "data/data_fm_20.json"),
            ),
            (
                Variant::Agrifence,
                VariantAssets::named("esp/agrifence.bin", "stm/agrifence.bin", "data/data_gw_agrifence.json"),
            ),
            (
                Variant::Zap,
                VariantAssets::named("esp/zap.bin", "stm/zap.bin", "data/data_gw_zap.json"),
            ),
            (
                Variant::Default,
                VariantAssets::named("esp/default.bin", "stm/default.bin", "data/data_gw_100.json"),
            ),
        ]);
        Self {
            asset_root: PathBuf::from("."),
            results_dir: PathBuf::from("results"),
            rf: RfConfig::default(),
            psu: PsuConfig::default(),
            radio: RadioToolConfig::default(),
            mcu: McuToolConfig::default(),
            variants,
            identifiers: IdentifierRules::default(),
            limits: SequenceLimits::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.asset_root.join(path)
        }
    }

    fn resolve_slot(&self, slot: &ImageSlot) -> ImageSlot {
        ImageSlot {
            path: self.resolve(&slot.path),
            address: slot.address,
        }
    }
}

/// Images and EEPROM records for one variant, paths resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImageSet {
    /// Partition table, OTA data, bootloader, application.
    pub radio: Vec<ImageSlot>,
    /// Startup, bootloader, application.
    pub mcu: Vec<ImageSlot>,
    pub eeprom: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantConfig {
    /// The entry actually used; `Default` when the variant has none.
    pub variant: Variant,
    pub images: FirmwareImageSet,
}

pub trait ConfigProvider: Send + Sync {
    fn variant_config(&self, variant: Variant) -> Result<VariantConfig, ConfigError>;
}

impl ConfigProvider for StationConfig {
    fn variant_config(&self, variant: Variant) -> Result<VariantConfig, ConfigError> {
        let (used, assets) = match self.variants.get(&variant) {
            Some(assets) => (variant, assets),
            None => {
                let assets = self
                    .variants
                    .get(&Variant::Default)
                    .ok_or(ConfigError::MissingVariant(variant))?;
                log::warn!("no configuration for {}, using Default", variant);
                (Variant::Default, assets)
            }
        };

        let images = FirmwareImageSet {
            radio: vec![
                self.resolve_slot(&self.radio.partition_table),
                self.resolve_slot(&self.radio.ota_data),
                self.resolve_slot(&self.radio.bootloader),
                ImageSlot {
                    path: self.resolve(&assets.radio_application),
                    address: self.radio.application_address,
                },
            ],
            mcu: vec![
                self.resolve_slot(&self.mcu.startup),
                self.resolve_slot(&self.mcu.bootloader),
                ImageSlot {
                    path: self.resolve(&assets.mcu_application),
                    address: self.mcu.application_address,
                },
            ],
            eeprom: self.resolve(&assets.eeprom),
        };
        Ok(VariantConfig { variant: used, images })
    }
}
