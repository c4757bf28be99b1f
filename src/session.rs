//! The unit under test: what is being built, who it is and how far it got.

use crate::config::IdentifierRules;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unit id '{id}' must start with '{prefix}' and be {len} characters long")]
    UnitId { id: String, prefix: String, len: usize },
    #[error("protocol id '{id}' must start with '{prefix}' and be {len} characters long")]
    ProtocolId { id: String, prefix: String, len: usize },
    #[error("unknown device variant '{0}'")]
    UnknownVariant(String),
}

/// Device families the station can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    #[serde(rename = "GW100")]
    Gw100,
    #[serde(rename = "FM20")]
    Fm20,
    Agrifence,
    #[serde(rename = "Zap!")]
    Zap,
    Default,
}

impl Variant {
    pub const ALL: [Variant; 5] = [
        Variant::Gw100,
        Variant::Fm20,
        Variant::Agrifence,
        Variant::Zap,
        Variant::Default,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Variant::Gw100 => "GW100",
            Variant::Fm20 => "FM20",
            Variant::Agrifence => "Agrifence",
            Variant::Zap => "Zap!",
            Variant::Default => "Default",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Variant {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Variant::ALL
            .into_iter()
            .find(|v| v.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ValidationError::UnknownVariant(wanted.to_string()))
    }
}

/// Pipeline steps, in the order they must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Psu,
    Esp,
    Stm,
    Measure,
    Finish,
}

impl Step {
    pub const ORDER: [Step; 5] = [Step::Psu, Step::Esp, Step::Stm, Step::Measure, Step::Finish];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn label(self) -> &'static str {
        match self {
            Step::Psu => "power supply init",
            Step::Esp => "radio programming",
            Step::Stm => "MCU programming",
            Step::Measure => "electrical checks",
            Step::Finish => "final check",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Completion flags of the pipeline steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checklist(u8);

impl Checklist {
    pub fn is_set(self, step: Step) -> bool {
        self.0 & step.bit() != 0
    }

    pub fn set(&mut self, step: Step) {
        self.0 |= step.bit();
    }

    pub fn unset(&mut self, step: Step) {
        self.0 &= !step.bit();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// The step the pipeline resumes at.
    pub fn first_unset(self) -> Option<Step> {
        Step::ORDER.into_iter().find(|s| !self.is_set(*s))
    }

    pub fn is_complete(self) -> bool {
        self.first_unset().is_none()
    }

    pub fn iter(self) -> impl Iterator<Item = (Step, bool)> {
        Step::ORDER.into_iter().map(move |s| (s, self.is_set(s)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[default]
    Pending,
    Pass,
    Fail,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pending => "PENDING",
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        }
    }
}

/// One physical unit being provisioned.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Completions carrying another id belong to an earlier unit.
    pub id: u64,
    pub variant: Variant,
    pub protocol_id: Option<String>,
    pub unit_id: Option<String>,
    pub address: Option<String>,
    pub radio_identity: Option<String>,
    pub checklist: Checklist,
    pub verdict: Verdict,
    pub failed_checks: Vec<String>,
    /// Keep the protocol id for the next unit of the same batch.
    pub continue_batch: bool,
    /// Last step that reported failure, cleared once a step succeeds again.
    pub failed_step: Option<Step>,
}

impl Session {
    pub fn new(id: u64, variant: Variant) -> Self {
        Self {
            id,
            variant,
            protocol_id: None,
            unit_id: None,
            address: None,
            radio_identity: None,
            checklist: Checklist::default(),
            verdict: Verdict::Pending,
            failed_checks: Vec::new(),
            continue_batch: false,
            failed_step: None,
        }
    }

    /// Fresh session for the next unit. The protocol id survives only for
    /// the same variant in continue mode.
    pub fn next(&self, id: u64, variant: Variant) -> Self {
        let mut next = Session::new(id, variant);
        next.continue_batch = self.continue_batch;
        if variant == self.variant && self.continue_batch {
            next.protocol_id = self.protocol_id.clone();
        }
        next
    }
}

fn check_id(id: &str, prefix: &str, len: usize, dev_mode: bool) -> bool {
    dev_mode || (id.starts_with(prefix) && id.chars().count() == len)
}

pub fn validate_unit_id(rules: &IdentifierRules, id: &str) -> Result<(), ValidationError> {
    if check_id(id, &rules.unit_prefix, rules.unit_len, rules.dev_mode) {
        Ok(())
    } else {
        Err(ValidationError::UnitId {
            id: id.to_string(),
            prefix: rules.unit_prefix.clone(),
            len: rules.unit_len,
        })
    }
}

pub fn validate_protocol_id(rules: &IdentifierRules, id: &str) -> Result<(), ValidationError> {
    if check_id(id, &rules.protocol_prefix, rules.protocol_len, rules.dev_mode) {
        Ok(())
    } else {
        Err(ValidationError::ProtocolId {
            id: id.to_string(),
            prefix: rules.protocol_prefix.clone(),
            len: rules.protocol_len,
        })
    }
}

/// Low byte every generated address carries.
pub const ADDRESS_SUFFIX: u64 = 0x08;

/// Packs a UTC timestamp into an address: seconds in the upper half,
/// milliseconds above the suffix byte.
pub fn address_at(secs: u64, millis: u32) -> u64 {
    (secs << 32) | (u64::from(millis % 1000) << 8) | ADDRESS_SUFFIX
}

static LAST_ADDRESS: AtomicU64 = AtomicU64::new(0);

/// Next unit address, strictly greater than any returned before in this process.
pub fn next_address(now: SystemTime) -> u64 {
    let since = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let candidate = address_at(since.as_secs(), since.subsec_millis());
    let mut last = LAST_ADDRESS.load(Ordering::Relaxed);
    loop {
        let next = if candidate > last { candidate } else { last + 0x100 };
        match LAST_ADDRESS.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(seen) => last = seen,
        }
    }
}

pub fn format_address(address: u64) -> String {
    format!("0x{:X}", address)
}

pub fn generate_unit_address() -> String {
    format_address(next_address(SystemTime::now()))
}
