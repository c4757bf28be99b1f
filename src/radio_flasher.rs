//! Radio chip programming through its serial bootloader.
//!
//! The flashing tool is run once per operation. Progress lines of the write
//! step are forwarded to the operator log.

use crate::collaborators::{LogSink, Severity};
use crate::config::RadioToolConfig;
use crate::eeprom::EepromRecord;
use crate::firmware::{find_failure, progress_line, FlashError, Flasher, ImageSlot, ToolOutput, ToolRunner};
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Output that means the tool gave up even if it exited cleanly.
pub const FAILURE_PHRASES: [&str; 2] = ["A fatal error occurred", "Failed to connect"];

/// Serial port whose USB description contains `hint`.
pub fn find_port_by_description(hint: &str) -> Option<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("serial port enumeration failed: {}", e);
            return None;
        }
    };
    ports.into_iter().find_map(|port| {
        let described = match &port.port_type {
            serialport::SerialPortType::UsbPort(info) => info
                .product
                .as_deref()
                .is_some_and(|product| product.contains(hint)),
            _ => false,
        };
        described.then_some(port.port_name)
    })
}

/// The chip's factory MAC as printed by the tool.
pub fn parse_identity(output: &str) -> Option<String> {
    static MAC: OnceLock<Regex> = OnceLock::new();
    let re = MAC.get_or_init(|| Regex::new(r"MAC: ([0-9a-fA-F:]+)").expect("static regex"));
    re.captures(output).map(|c| c[1].to_string())
}

pub struct RadioFlasher {
    settings: RadioToolConfig,
    runner: Arc<dyn ToolRunner>,
    log: Arc<dyn LogSink>,
    port: Option<String>,
}

impl RadioFlasher {
    pub fn new(settings: RadioToolConfig, runner: Arc<dyn ToolRunner>, log: Arc<dyn LogSink>) -> Self {
        Self {
            settings,
            runner,
            log,
            port: None,
        }
    }

    /// Skips port discovery.
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    fn port(&mut self) -> Result<String, FlashError> {
        if let Some(port) = &self.port {
            return Ok(port.clone());
        }
        let port = match find_port_by_description(&self.settings.port_hint) {
            Some(port) => port,
            None if !self.settings.fallback_port.is_empty() => {
                log::warn!(
                    "no port described as '{}', using {}",
                    self.settings.port_hint,
                    self.settings.fallback_port
                );
                self.settings.fallback_port.clone()
            }
            None => return Err(FlashError::PortNotFound(self.settings.port_hint.clone())),
        };
        self.port = Some(port.clone());
        Ok(port)
    }

    fn invoke(&self, step: &'static str, tail: Vec<String>, show_progress: bool) -> Result<ToolOutput, FlashError> {
        let mut args = self.settings.leading_args.clone();
        args.extend(tail);

        let sink = &self.log;
        let output = self
            .runner
            .run(&self.settings.program, &args, &mut |line| {
                log::debug!("{}", line);
                if show_progress {
                    if let Some(progress) = progress_line(line) {
                        sink.log(&progress, Severity::Info);
                    }
                }
            })
            .map_err(|source| FlashError::Spawn {
                tool: self.settings.program.display().to_string(),
                source,
            })?;

        if let Some(phrase) = find_failure(&output.text, &FAILURE_PHRASES) {
            return Err(FlashError::Failed {
                step,
                reason: phrase.to_string(),
            });
        }
        if !output.success() {
            let reason = output
                .text
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output")
                .trim()
                .to_string();
            return Err(FlashError::Failed { step, reason });
        }
        Ok(output)
    }
}

impl Flasher for RadioFlasher {
    fn target(&self) -> &'static str {
        "radio"
    }

    fn connect(&mut self) -> Result<String, FlashError> {
        let port = self.port()?;
        let output = self.invoke("connect", vec!["--port".into(), port.clone(), "read_mac".into()], false)?;
        let identity = parse_identity(&output.text).unwrap_or_else(|| "unknown".to_string());
        log::info!("radio chip on {} answered, MAC {}", port, identity);
        Ok(identity)
    }

    fn erase(&mut self) -> Result<(), FlashError> {
        let port = self.port()?;
        self.invoke(
            "erase",
            vec![
                "--baud".into(),
                self.settings.baud_rate.to_string(),
                "--port".into(),
                port,
                "erase_flash".into(),
            ],
            false,
        )?;
        Ok(())
    }

    /// Writes partition table, OTA data, bootloader and application in one go.
    fn program(&mut self, images: &[ImageSlot]) -> Result<(), FlashError> {
        if images.len() != 4 {
            return Err(FlashError::ImageCount {
                expected: 4,
                got: images.len(),
            });
        }
        for image in images {
            image.ensure_exists()?;
        }
        let port = self.port()?;

        let mut args: Vec<String> = vec![
            "--port".into(),
            port,
            "--baud".into(),
            self.settings.baud_rate.to_string(),
            "--before".into(),
            "default_reset".into(),
            "--after".into(),
            "hard_reset".into(),
            "--chip".into(),
            self.settings.chip.clone(),
            "write_flash".into(),
            "--flash_mode".into(),
            "dio".into(),
            "--flash_freq".into(),
            "40m".into(),
            "--flash_size".into(),
            "detect".into(),
        ];
        for image in images {
            args.push(image.address.to_string());
            args.push(image.path.display().to_string());
        }
        self.invoke("program", args, true)?;
        Ok(())
    }

    /// The radio keeps its settings in the MCU's EEPROM; nothing to write here.
    fn patch_eeprom(&mut self, records: &[EepromRecord]) -> Result<(), FlashError> {
        log::debug!("radio target ignores {} EEPROM records", records.len());
        Ok(())
    }
}
