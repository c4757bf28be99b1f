//! The hardware side of every pipeline step.
//!
//! Each step runs on a worker thread and ends in a [`StepOutcome`]; errors of
//! the layers below stop here and become its `detail`.

use crate::collaborators::LogSink;
use crate::config::{FirmwareImageSet, StationConfig};
use crate::eeprom::{self, EepromError, EepromRecord};
use crate::firmware::{FlashError, Flasher, ImageSlot, ToolRunner};
use crate::mcu_flasher::McuFlasher;
use crate::psu::{self, Channel, PsuError, PsuLink};
use crate::radio_flasher::RadioFlasher;
use crate::rf::{Pin, RfError, RfLink, Signal};
use crate::sequencer::Sequencer;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Period of the busy blink, in milliseconds.
pub const BUSY_BLINK_MS: u32 = 100;

/// What the fixture LEDs show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Both LEDs blinking.
    Busy,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub ok: bool,
    pub detail: String,
    /// Names of failed electrical checks.
    pub failed_checks: Vec<String>,
    /// Identity read back from the radio chip.
    pub identity: Option<String>,
}

impl StepOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            ..Default::default()
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Psu(#[from] PsuError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Eeprom(#[from] EepromError),
}

/// Hardware operations the controller dispatches, one per pipeline step.
pub trait StepRunner: Send + Sync {
    fn init_psu(&self) -> StepOutcome;

    fn program_radio(&self, images: &FirmwareImageSet) -> StepOutcome;

    fn program_mcu(&self, images: &FirmwareImageSet) -> StepOutcome;

    fn measure(&self) -> StepOutcome;

    fn indicate(&self, indicator: Indicator);

    /// Starts delivering fixture signals to `on_signal`.
    fn start_listener(&self, _on_signal: Box<dyn FnMut(Signal) + Send>) -> Result<(), RfError> {
        Ok(())
    }

    fn shutdown(&self);
}

/// The production fixture: control board, bench supply and both programmers.
pub struct Fixture {
    config: Arc<StationConfig>,
    rf: RfLink,
    psu: Mutex<Box<dyn PsuLink>>,
    tools: Arc<dyn ToolRunner>,
    log: Arc<dyn LogSink>,
    radio_port: Option<String>,
}

impl Fixture {
    pub fn new(
        config: Arc<StationConfig>,
        rf: RfLink,
        psu: Box<dyn PsuLink>,
        tools: Arc<dyn ToolRunner>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            config,
            rf,
            psu: Mutex::new(psu),
            tools,
            log,
            radio_port: None,
        }
    }

    /// Programs the radio through `port` instead of looking for it.
    pub fn with_radio_port(mut self, port: impl Into<String>) -> Self {
        self.radio_port = Some(port.into());
        self
    }

    pub fn rf(&self) -> &RfLink {
        &self.rf
    }

    fn psu(&self) -> MutexGuard<'_, Box<dyn PsuLink>> {
        self.psu.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pin changes are best effort; a missing control board must not fail a step.
    fn pin(&self, pin: Pin, on: bool) {
        if let Err(e) = self.rf.set_pin(pin, on) {
            log::warn!("could not set {:?} {}: {}", pin, if on { "on" } else { "off" }, e);
        }
    }

    fn energize(&self, supply: &mut dyn PsuLink, channel: Channel, volts: f64, amps: f64) -> Result<(), PsuError> {
        psu::apply_and_enable(supply, channel, volts, amps, self.config.psu.settle())
    }

    fn flash(
        &self,
        flasher: &mut dyn Flasher,
        images: &[ImageSlot],
        records: &[EepromRecord],
        erase_settle: Duration,
    ) -> Result<String, StepError> {
        let target = flasher.target();
        let identity = flasher.connect()?;
        self.log.info(&format!("{} chip found: {}", target, identity));

        flasher.erase()?;
        self.log.info(&format!("{} chip erased", target));
        thread::sleep(erase_settle);

        flasher.program(images)?;
        flasher.patch_eeprom(records)?;
        Ok(identity)
    }

    fn try_init_psu(&self) -> Result<String, StepError> {
        self.pin(Pin::RadioPower, false);

        let identity = {
            let mut psu = self.psu();
            let identity = if psu.is_connected() {
                psu.identify()?
            } else {
                psu.connect()?
            };
            let limits = &self.config.limits;
            self.energize(&mut **psu, Channel::Main, limits.main_volts, limits.main_amps)?;
            psu.enable(Channel::Battery, false)?;
            identity
        };

        self.pin(Pin::RedLed, false);
        self.pin(Pin::ProgrammingMode, true);
        Ok(identity.trim().to_string())
    }

    /// Power-cycles the radio out of programming mode.
    fn release_radio(&self) {
        let step = Duration::from_millis(self.config.radio.pin_step_ms);
        if let Err(e) = self.rf.pulse_pin(Pin::RadioPower, true, step) {
            log::warn!("radio reset pulse failed: {}", e);
        }
        self.pin(Pin::RadioPower, false);
        thread::sleep(step);
        self.pin(Pin::ProgrammingMode, false);
        thread::sleep(step);
        self.pin(Pin::RadioPower, true);
    }

    fn try_program_mcu(&self, images: &FirmwareImageSet) -> Result<String, StepError> {
        {
            let mut psu = self.psu();
            let limits = &self.config.limits;
            self.energize(&mut **psu, Channel::Main, limits.main_volts, limits.main_amps)?;
            self.energize(&mut **psu, Channel::Battery, limits.battery_volts, limits.battery_amps)?;
        }
        let records = eeprom::load_records(&images.eeprom)?;
        let mut mcu = McuFlasher::new(self.config.mcu.clone(), Arc::clone(&self.tools), Arc::clone(&self.log));
        self.flash(&mut mcu, &images.mcu, &records, Duration::ZERO)
    }
}

impl StepRunner for Fixture {
    fn init_psu(&self) -> StepOutcome {
        match self.try_init_psu() {
            Ok(identity) => StepOutcome::success(format!("power supply ready: {}", identity)),
            Err(e) => StepOutcome::failure(format!("power supply init failed: {}", e)),
        }
    }

    fn program_radio(&self, images: &FirmwareImageSet) -> StepOutcome {
        self.pin(Pin::RadioPower, true);

        let mut radio = RadioFlasher::new(self.config.radio.clone(), Arc::clone(&self.tools), Arc::clone(&self.log));
        if let Some(port) = &self.radio_port {
            radio = radio.with_port(port.clone());
        }
        let settle = Duration::from_millis(self.config.radio.erase_settle_ms);
        let result = self.flash(&mut radio, &images.radio, &[], settle);

        self.release_radio();
        match result {
            Ok(identity) => StepOutcome {
                identity: Some(identity),
                ..StepOutcome::success("radio chip programmed")
            },
            Err(e) => StepOutcome::failure(format!("radio programming failed: {}", e)),
        }
    }

    fn program_mcu(&self, images: &FirmwareImageSet) -> StepOutcome {
        match self.try_program_mcu(images) {
            Ok(_) => StepOutcome::success("MCU programmed"),
            Err(e) => StepOutcome::failure(format!("MCU programming failed: {}", e)),
        }
    }

    fn measure(&self) -> StepOutcome {
        let report = {
            let mut psu = self.psu();
            Sequencer::new(&mut **psu, self.config.limits.clone(), self.config.timing.timing()).run()
        };
        if report.passed() {
            StepOutcome::success("all electrical checks passed")
        } else {
            let failed: Vec<String> = report.failed_names().into_iter().map(String::from).collect();
            StepOutcome {
                detail: format!("failed checks: {}", failed.join(", ")),
                failed_checks: failed,
                ..StepOutcome::failure("")
            }
        }
    }

    fn indicate(&self, indicator: Indicator) {
        let result = match indicator {
            Indicator::Busy => self
                .rf
                .set_blinking(Pin::RedLed, BUSY_BLINK_MS)
                .and_then(|_| self.rf.set_blinking(Pin::GreenLed, BUSY_BLINK_MS)),
            Indicator::Pass => self
                .rf
                .set_pin(Pin::RedLed, false)
                .and_then(|_| self.rf.set_pin(Pin::GreenLed, true)),
            Indicator::Fail => self
                .rf
                .set_pin(Pin::GreenLed, false)
                .and_then(|_| self.rf.set_pin(Pin::RedLed, true)),
        };
        if let Err(e) = result {
            log::warn!("could not show {:?} on the fixture: {}", indicator, e);
        }
    }

    fn start_listener(&self, on_signal: Box<dyn FnMut(Signal) + Send>) -> Result<(), RfError> {
        self.rf.listen(on_signal)
    }

    fn shutdown(&self) {
        if let Err(e) = self.rf.shutdown() {
            log::warn!("control board shutdown failed: {}", e);
        }
        if let Err(e) = self.psu().disconnect() {
            log::warn!("power supply disconnect failed: {}", e);
        }
    }
}
