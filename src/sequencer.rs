//! Electrical validation of the unit under test.
//!
//! Six checks always run in order; a failing check is recorded and the next
//! one still runs. All timeouts are poll counts, so the worst-case duration
//! is fixed by [`SequenceLimits`] and [`SequenceTiming`].

use crate::psu::{self, Channel, PsuError, PsuLink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Reset,
    LowPowerDetection,
    RiseEdge,
    BatteryCharging,
    MaxPowerConsumption,
    FinalReset,
}

impl Check {
    pub const ALL: [Check; 6] = [
        Check::Reset,
        Check::LowPowerDetection,
        Check::RiseEdge,
        Check::BatteryCharging,
        Check::MaxPowerConsumption,
        Check::FinalReset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Check::Reset => "reset",
            Check::LowPowerDetection => "low_power_detection",
            Check::RiseEdge => "rise_edge",
            Check::BatteryCharging => "battery_charging",
            Check::MaxPowerConsumption => "max_power_consumption",
            Check::FinalReset => "final_reset",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Electrical thresholds, in volts and amperes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceLimits {
    pub main_volts: f64,
    pub main_amps: f64,
    pub battery_volts: f64,
    pub battery_amps: f64,
    /// Battery current below which the unit is considered asleep.
    pub low_power_max_amps: f64,
    pub low_power_polls: u32,
    /// Main current the unit must draw once powered.
    pub rise_edge_min_amps: f64,
    pub charge_min_volts: f64,
    pub charge_max_volts: f64,
    pub charge_polls: u32,
    pub max_power_ceiling_amps: f64,
    pub max_power_samples: u32,
}

impl Default for SequenceLimits {
    fn default() -> Self {
        Self {
            main_volts: 14.0,
            main_amps: 0.5,
            battery_volts: 8.3,
            battery_amps: 0.5,
            low_power_max_amps: 0.003,
            low_power_polls: 17,
            rise_edge_min_amps: 0.030,
            charge_min_volts: 11.0,
            charge_max_volts: 12.0,
            charge_polls: 17,
            max_power_ceiling_amps: 0.200,
            max_power_samples: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceTiming {
    pub poll_interval: Duration,
    pub reset_settle: Duration,
    pub apply_settle: Duration,
    pub rise_edge_settle: Duration,
    pub final_settle: Duration,
}

impl Default for SequenceTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reset_settle: Duration::from_millis(500),
            apply_settle: Duration::from_secs(1),
            rise_edge_settle: Duration::from_secs(5),
            final_settle: Duration::from_secs(1),
        }
    }
}

impl SequenceTiming {
    /// No waiting at all; for simulated supplies.
    pub fn instant() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            reset_settle: Duration::ZERO,
            apply_settle: Duration::ZERO,
            rise_edge_settle: Duration::ZERO,
            final_settle: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub check: Check,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl SequenceReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failed(&self) -> Vec<Check> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.check)
            .collect()
    }

    pub fn failed_names(&self) -> Vec<&'static str> {
        self.failed().into_iter().map(Check::name).collect()
    }
}

pub struct Sequencer<'a, P: PsuLink + ?Sized> {
    psu: &'a mut P,
    limits: SequenceLimits,
    timing: SequenceTiming,
}

impl<'a, P: PsuLink + ?Sized> Sequencer<'a, P> {
    pub fn new(psu: &'a mut P, limits: SequenceLimits, timing: SequenceTiming) -> Self {
        Self { psu, limits, timing }
    }

    /// Runs every check once and collects the outcomes.
    pub fn run(&mut self) -> SequenceReport {
        let mut report = SequenceReport::default();
        for check in Check::ALL {
            log::info!("electrical check '{}' started", check);
            let passed = match self.run_check(check) {
                Ok(passed) => passed,
                Err(e) => {
                    log::error!("electrical check '{}' aborted: {}", check, e);
                    false
                }
            };
            if passed {
                log::info!("electrical check '{}' passed", check);
            } else {
                log::warn!("electrical check '{}' failed", check);
            }
            report.outcomes.push(CheckOutcome { check, passed });
        }
        report
    }

    fn run_check(&mut self, check: Check) -> Result<bool, PsuError> {
        match check {
            Check::Reset => self.reset(),
            Check::LowPowerDetection => self.low_power_detection(),
            Check::RiseEdge => self.rise_edge(),
            Check::BatteryCharging => self.battery_charging(),
            Check::MaxPowerConsumption => self.max_power_consumption(),
            Check::FinalReset => self.final_reset(),
        }
    }

    /// Cold power-up from the battery only.
    fn reset(&mut self) -> Result<bool, PsuError> {
        self.psu.enable(Channel::Main, false)?;
        self.psu.enable(Channel::Battery, false)?;
        thread::sleep(self.timing.reset_settle);

        for (channel, volts) in [
            (Channel::Battery, self.limits.battery_volts),
            (Channel::Main, self.limits.main_volts),
        ] {
            if !psu::power(&mut *self.psu, channel, volts, self.timing.apply_settle)? {
                log::warn!("channel {} did not reach {:.2} V during reset", channel.number(), volts);
            }
        }
        thread::sleep(self.timing.reset_settle);

        self.psu.enable(Channel::Main, false)?;
        thread::sleep(self.timing.reset_settle);
        Ok(true)
    }

    fn low_power_detection(&mut self) -> Result<bool, PsuError> {
        self.psu.enable(Channel::Main, false)?;

        for poll in 1..=self.limits.low_power_polls {
            thread::sleep(self.timing.poll_interval);
            let amps = self.psu.measure_current(Channel::Battery)?;
            log::debug!("low power poll {}: {:.2} mA", poll, amps * 1000.0);
            if amps < self.limits.low_power_max_amps {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn rise_edge(&mut self) -> Result<bool, PsuError> {
        psu::apply_and_enable(
            &mut *self.psu,
            Channel::Main,
            self.limits.main_volts,
            self.limits.main_amps,
            self.timing.apply_settle,
        )?;
        thread::sleep(self.timing.rise_edge_settle);

        let amps = self.psu.measure_current(Channel::Main)?;
        log::debug!("rise edge current: {:.2} mA", amps * 1000.0);
        Ok(amps >= self.limits.rise_edge_min_amps)
    }

    fn battery_charging(&mut self) -> Result<bool, PsuError> {
        let mut max_volts = f64::MIN;

        for poll in 1..=self.limits.charge_polls {
            thread::sleep(self.timing.poll_interval);
            let volts = self.psu.measure_voltage(Channel::Battery)?;
            max_volts = max_volts.max(volts);
            log::debug!("charge poll {}: {:.3} V (max {:.3} V)", poll, volts, max_volts);
            if max_volts > self.limits.charge_min_volts && max_volts < self.limits.charge_max_volts {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn max_power_consumption(&mut self) -> Result<bool, PsuError> {
        let mut max_amps = 0.0_f64;

        for sample in 1..=self.limits.max_power_samples {
            thread::sleep(self.timing.poll_interval);
            let amps = self.psu.measure_current(Channel::Main)?;
            max_amps = max_amps.max(amps);
            log::debug!("power sample {}: max {:.2} mA", sample, max_amps * 1000.0);
            if max_amps > self.limits.max_power_ceiling_amps {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Leaves the bench at its idle resting state.
    fn final_reset(&mut self) -> Result<bool, PsuError> {
        psu::power(&mut *self.psu, Channel::Main, 0.0, self.timing.apply_settle)?;
        psu::power(&mut *self.psu, Channel::Battery, 0.0, self.timing.apply_settle)?;
        thread::sleep(self.timing.final_settle);
        psu::apply_and_enable(
            &mut *self.psu,
            Channel::Main,
            self.limits.main_volts,
            self.limits.main_amps,
            self.timing.apply_settle,
        )?;
        Ok(true)
    }
}
