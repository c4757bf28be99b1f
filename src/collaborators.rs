//! Everything the station talks to that is not hardware: the operator's log
//! view, prompts, the asset store, the result store and sign-in.
//!
//! The traits are what the controller needs. The adapters shipped here are
//! the simple file-based ones the command line station uses.

use crate::config::ConfigProvider;
use crate::session::Variant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Debug,
    Success,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Debug => "DEBUG",
            Severity::Success => "OK",
        }
    }
}

/// Messages shorter than two characters carry nothing and are dropped.
pub fn worth_logging(message: &str) -> bool {
    message.trim().chars().count() > 1
}

/// The operator-facing log.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str, severity: Severity);

    fn info(&self, message: &str) {
        self.log(message, Severity::Info);
    }

    fn warn(&self, message: &str) {
        self.log(message, Severity::Warning);
    }

    fn error(&self, message: &str) {
        self.log(message, Severity::Error);
    }

    fn success(&self, message: &str) {
        self.log(message, Severity::Success);
    }
}

/// Forwards operator messages to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn log(&self, message: &str, severity: Severity) {
        if !worth_logging(message) {
            return;
        }
        match severity {
            Severity::Info => log::info!("{}", message),
            Severity::Success => log::info!("OK {}", message),
            Severity::Warning => log::warn!("{}", message),
            Severity::Error => log::error!("{}", message),
            Severity::Debug => log::debug!("{}", message),
        }
    }
}

pub trait Prompt: Send + Sync {
    fn confirm(&self, question: &str) -> bool;

    /// Free text answer, `None` when the operator cancels.
    fn ask(&self, question: &str) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset fetch failed: {0}")]
    Fetch(String),
    #[error("missing asset {0}")]
    Missing(PathBuf),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Makes the per-variant images and EEPROM file available locally.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, variant: Variant) -> Result<(), AssetError>;
}

/// Assets that are already on disk; fetching only checks they are there.
pub struct LocalAssets {
    provider: Arc<dyn ConfigProvider>,
}

impl LocalAssets {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self { provider }
    }
}

impl AssetFetcher for LocalAssets {
    fn fetch(&self, variant: Variant) -> Result<(), AssetError> {
        let resolved = self.provider.variant_config(variant)?;
        let images = &resolved.images;
        let paths = images
            .radio
            .iter()
            .chain(images.mcu.iter())
            .map(|slot| slot.path.as_path())
            .chain(std::iter::once(images.eeprom.as_path()));
        for path in paths {
            if !path.exists() {
                return Err(AssetError::Missing(path.to_path_buf()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    pub role: String,
}

pub trait CredentialCheck: Send + Sync {
    fn verify(&self, user: &str, secret: &str) -> Option<Operator>;
}

/// What is kept about every finished unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub device: String,
    pub username: String,
    pub role: String,
    pub protocol: String,
    pub desk_id: String,
    pub box_id: String,
    pub mac: String,
    pub result: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_checks: Vec<String>,
}

/// Key used for records without a unit id.
pub const ANONYMOUS_UNIT: &str = "test_123";

impl UnitRecord {
    pub fn key(&self) -> &str {
        if self.desk_id.is_empty() {
            ANONYMOUS_UNIT
        } else {
            &self.desk_id
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait ResultSink: Send + Sync {
    /// Stores `record`, replacing any earlier record of the same unit.
    fn save(&self, record: &UnitRecord) -> Result<(), SinkError>;
}

/// Keeps records as JSON files under one directory:
///
/// - `<root>/<device>/records.json`: every unit of the device, keyed by unit id
/// - `<root>/<device>/<unit id>/record.json`: the unit on its own
pub struct JsonResultSink {
    root: PathBuf,
}

impl JsonResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn load_map(path: &Path) -> Result<BTreeMap<String, UnitRecord>, SinkError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Self::io_err(path)(e)),
        }
    }
}

impl ResultSink for JsonResultSink {
    fn save(&self, record: &UnitRecord) -> Result<(), SinkError> {
        let device_dir = self.root.join(&record.device);
        let unit_dir = device_dir.join(record.key());
        fs::create_dir_all(&unit_dir).map_err(Self::io_err(&unit_dir))?;

        let global = device_dir.join("records.json");
        let mut all = Self::load_map(&global)?;
        all.insert(record.key().to_string(), record.clone());
        fs::write(&global, serde_json::to_string_pretty(&all)?).map_err(Self::io_err(&global))?;

        let single = unit_dir.join("record.json");
        fs::write(&single, serde_json::to_string_pretty(record)?).map_err(Self::io_err(&single))?;

        log::debug!("record of unit {} stored under {}", record.key(), device_dir.display());
        Ok(())
    }
}
