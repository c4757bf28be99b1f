//! MCU programming through the debug probe's command line interface.
//!
//! The CLI's exit code is not reliable, so each run is judged by scanning its
//! output for the phrases it prints on failure.

use crate::collaborators::{LogSink, Severity};
use crate::config::McuToolConfig;
use crate::eeprom::{encode_value, plan_write, EepromRecord, WritePlan};
use crate::firmware::{find_failure, progress_line, FlashError, Flasher, ImageSlot, ToolRunner};
use regex::Regex;
use std::sync::{Arc, OnceLock};

pub const FAILURE_PHRASES: [&str; 5] = [
    "No ST-LINK detected!",
    "Elf Loader could not be transfered to device.",
    "Read out protection is activated.",
    "Error occured during program operation!",
    "Unexpected error",
];

fn device_name(output: &str) -> Option<String> {
    static NAME: OnceLock<Regex> = OnceLock::new();
    let re = NAME.get_or_init(|| Regex::new(r"Device name\s*:\s*(.+)").expect("static regex"));
    re.captures(output).map(|c| c[1].trim().to_string())
}

pub struct McuFlasher {
    settings: McuToolConfig,
    runner: Arc<dyn ToolRunner>,
    log: Arc<dyn LogSink>,
}

impl McuFlasher {
    pub fn new(settings: McuToolConfig, runner: Arc<dyn ToolRunner>, log: Arc<dyn LogSink>) -> Self {
        Self { settings, runner, log }
    }

    /// Probe connection arguments, optionally holding the chip under reset.
    fn probe(&self, under_reset: bool) -> Vec<String> {
        let mut args = vec!["-c".to_string(), "ID=0".to_string(), "SWD".to_string()];
        if under_reset {
            args.push("UR".to_string());
        }
        args.push(format!("freq={}", self.settings.frequency_khz));
        args
    }

    fn invoke(&self, step: &'static str, args: Vec<String>) -> Result<String, FlashError> {
        let sink = &self.log;
        let output = self
            .runner
            .run(&self.settings.cli_path, &args, &mut |line| {
                log::debug!("{}", line);
                if let Some(progress) = progress_line(line) {
                    sink.log(&progress, Severity::Debug);
                }
            })
            .map_err(|source| FlashError::Spawn {
                tool: self.settings.cli_path.display().to_string(),
                source,
            })?;

        if let Some(phrase) = find_failure(&output.text, &FAILURE_PHRASES) {
            return Err(FlashError::Failed {
                step,
                reason: phrase.to_string(),
            });
        }
        if !output.success() {
            log::debug!("{} exited with {:?} without a known failure", step, output.status);
        }
        Ok(output.text)
    }

    fn write(&self, width: &str, address: String, value: String) -> Result<(), FlashError> {
        let mut args = self.probe(false);
        args.extend([width.to_string(), address, value]);
        self.invoke("eeprom write", args)?;
        Ok(())
    }
}

impl Flasher for McuFlasher {
    fn target(&self) -> &'static str {
        "mcu"
    }

    fn connect(&mut self) -> Result<String, FlashError> {
        self.invoke("probe list", vec!["-List".to_string()])?;
        let mut args = self.probe(true);
        args.push("-NoPrompt".to_string());
        let output = self.invoke("connect", args)?;
        let name = device_name(&output).unwrap_or_else(|| "connected".to_string());
        log::info!("MCU answered: {}", name);
        Ok(name)
    }

    /// Clears readout protection, the EEPROM data page and then the whole chip.
    fn erase(&mut self) -> Result<(), FlashError> {
        let run = ["-V", "-NoPrompt", "-Run"].map(String::from);

        let mut unprotect = self.probe(true);
        unprotect.extend(["-OB".to_string(), "RDP=0".to_string()]);
        unprotect.extend(run.clone());
        self.invoke("readout unprotect", unprotect)?;

        let mut data_page = self.probe(false);
        data_page.extend(["-SE".to_string(), "ed1".to_string()]);
        data_page.extend(run.clone());
        self.invoke("data erase", data_page)?;

        let mut mass = self.probe(false);
        mass.push("-ME".to_string());
        mass.extend(run);
        self.invoke("mass erase", mass)?;
        Ok(())
    }

    /// Writes startup, bootloader and application images, one run each.
    fn program(&mut self, images: &[ImageSlot]) -> Result<(), FlashError> {
        if images.len() != 3 {
            return Err(FlashError::ImageCount {
                expected: 3,
                got: images.len(),
            });
        }
        for image in images {
            image.ensure_exists()?;
            let mut args = self.probe(true);
            args.extend([
                "-P".to_string(),
                image.path.display().to_string(),
                image.address.to_string(),
                "-V".to_string(),
                "-NoPrompt".to_string(),
                "-Run".to_string(),
            ]);
            self.invoke("program", args)?;
            self.log
                .info(&format!("{} written at {}", image.path.display(), image.address));
        }
        Ok(())
    }

    fn patch_eeprom(&mut self, records: &[EepromRecord]) -> Result<(), FlashError> {
        for record in records {
            let Some(literal) = encode_value(&record.value) else {
                log::debug!("EEPROM record at {} has no value, skipped", record.address);
                continue;
            };
            match plan_write(&record.address, &literal)? {
                WritePlan::Byte { address, value } => self.write("-w8", address, value)?,
                WritePlan::Word { address, value } => self.write("-w32", address, value)?,
                WritePlan::Bytes(bytes) => {
                    for (address, byte) in bytes {
                        self.write("-w8", format!("0x{:08X}", address), format!("0x{:02X}", byte))?;
                    }
                }
            }
            log::debug!("EEPROM {} = {}", record.address, literal);
        }
        Ok(())
    }
}
