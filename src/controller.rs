//! The station state machine.
//!
//! The controller owns the session of the unit on the fixture and decides
//! which step runs next. It never touches hardware itself: every step goes
//! to the worker pool and reports back through the controller's inbox as a
//! [`StationEvent`]. The checklist is the resumption cursor, so re-running
//! [`Controller::advance`] after a failure repeats the step that failed.
//!
//! ```text
//! Idle -> AssetsReady -> PsuInit -> EspProgrammed -> StmProgrammed -> Measured -> Finished
//!   \__________________________________________________________________________/
//!                                    any failure -> Failed
//! ```

use crate::collaborators::{
    AssetError, AssetFetcher, CredentialCheck, LogSink, Operator, Prompt, ResultSink, Severity, UnitRecord,
};
use crate::config::{ConfigError, ConfigProvider, FirmwareImageSet, IdentifierRules};
use crate::eeprom::{self, EepromError};
use crate::fixture::{Indicator, StepOutcome, StepRunner};
use crate::rf::{RfError, Signal};
use crate::session::{self, Checklist, Session, Step, ValidationError, Variant, Verdict};
use crate::worker::WorkerPool;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_WORKERS: usize = 2;

pub const QUESTION_PROTOCOL_ID: &str = "Protocol ID";
pub const QUESTION_UNIT_ID: &str = "Unit ID";
pub const QUESTION_UNIT_INSERTED: &str = "Is the unit placed in the fixture?";
pub const QUESTION_DISPLAY_LIT: &str = "Is the display lit and the text visible?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AssetsReady,
    PsuInit,
    EspProgrammed,
    StmProgrammed,
    Measured,
    Finished,
    Failed,
}

/// Background jobs the controller dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Assets,
    PsuInit,
    RadioFlash,
    McuFlash,
    Measure,
    Save,
}

impl StepKind {
    fn for_step(step: Step) -> Option<StepKind> {
        match step {
            Step::Psu => Some(StepKind::PsuInit),
            Step::Esp => Some(StepKind::RadioFlash),
            Step::Stm => Some(StepKind::McuFlash),
            Step::Measure => Some(StepKind::Measure),
            Step::Finish => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Assets => "asset fetch",
            StepKind::PsuInit => "power supply init",
            StepKind::RadioFlash => "radio programming",
            StepKind::McuFlash => "MCU programming",
            StepKind::Measure => "electrical checks",
            StepKind::Save => "result save",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub session: u64,
    pub kind: StepKind,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    Completed(Completion),
    Signal(Signal),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a step is still running")]
    Busy,
    #[error("assets for the selected device are not ready")]
    AssetsNotReady,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no unit address generated yet")]
    MissingAddress,
    #[error("no failed step to retry")]
    NoFailedStep,
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Eeprom(#[from] EepromError),
    #[error("sign-in rejected for '{0}'")]
    Rejected(String),
    #[error("worker pool is not running")]
    PoolClosed,
    #[error("fixture listener: {0}")]
    Listener(#[from] RfError),
}

/// The external collaborators the controller reports to and asks.
#[derive(Clone)]
pub struct Collaborators {
    pub log: Arc<dyn LogSink>,
    pub prompt: Arc<dyn Prompt>,
    pub assets: Arc<dyn AssetFetcher>,
    pub results: Arc<dyn ResultSink>,
    pub credentials: Arc<dyn CredentialCheck>,
}

pub struct Controller {
    provider: Arc<dyn ConfigProvider>,
    rules: IdentifierRules,
    runner: Arc<dyn StepRunner>,
    with: Collaborators,
    pool: WorkerPool,
    inbox_tx: Sender<StationEvent>,
    inbox: Receiver<StationEvent>,
    session: Session,
    state: State,
    in_flight: Option<StepKind>,
    images: Option<FirmwareImageSet>,
    operator: Option<Operator>,
    last_session: u64,
    shut_down: bool,
}

impl Controller {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        rules: IdentifierRules,
        runner: Arc<dyn StepRunner>,
        with: Collaborators,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::channel();
        Self {
            provider,
            rules,
            runner,
            with,
            pool: WorkerPool::new(DEFAULT_WORKERS),
            inbox_tx,
            inbox,
            session: Session::new(1, Variant::Default),
            state: State::Idle,
            in_flight: None,
            images: None,
            operator: None,
            last_session: 1,
            shut_down: false,
        }
    }

    // --- Read-only view ---

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn checklist(&self) -> Checklist {
        self.session.checklist
    }

    pub fn in_flight(&self) -> Option<StepKind> {
        self.in_flight
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn operator(&self) -> Option<&Operator> {
        self.operator.as_ref()
    }

    /// Sender for events from outside the worker pool.
    pub fn events(&self) -> Sender<StationEvent> {
        self.inbox_tx.clone()
    }

    // --- Operator actions ---

    pub fn sign_in(&mut self, user: &str, secret: &str) -> Result<Operator, ControllerError> {
        match self.with.credentials.verify(user, secret) {
            Some(operator) => {
                self.with
                    .log
                    .success(&format!("signed in as {} ({})", operator.name, operator.role));
                self.operator = Some(operator.clone());
                Ok(operator)
            }
            None => {
                self.with.log.error(&format!("sign-in rejected for {}", user));
                Err(ControllerError::Rejected(user.to_string()))
            }
        }
    }

    /// Keep the protocol id when the next unit starts.
    pub fn set_continue_batch(&mut self, on: bool) {
        self.session.continue_batch = on;
    }

    /// Starts a new unit of `variant` and fetches its assets in the background.
    pub fn begin_unit(&mut self, variant: Variant) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        self.reset_session(variant);
        self.images = None;
        self.state = State::Idle;
        self.with.log.info(&format!("preparing assets for {}", variant));

        let assets = Arc::clone(&self.with.assets);
        self.dispatch(StepKind::Assets, move || match assets.fetch(variant) {
            Ok(()) => StepOutcome::success(format!("assets for {} ready", variant)),
            Err(e) => StepOutcome::failure(e.to_string()),
        })
    }

    /// Switches device variant. The same variant only restarts the unit.
    pub fn change_variant(&mut self, variant: Variant) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        if variant == self.session.variant && self.images.is_some() {
            self.reset_session(variant);
            self.state = State::AssetsReady;
            self.with.log.info(&format!("restarting {} unit", variant));
            return Ok(());
        }
        self.begin_unit(variant)
    }

    /// Generates the unit's hardware address and stores it on the session.
    pub fn generate_unit_address(&mut self) -> String {
        let address = session::generate_unit_address();
        self.with.log.info(&format!("unit address {}", address));
        self.session.address = Some(address.clone());
        address
    }

    /// Validates and stores both identifiers.
    pub fn set_identifiers(&mut self, protocol_id: &str, unit_id: &str) -> Result<(), ControllerError> {
        let protocol_id = protocol_id.trim();
        let unit_id = unit_id.trim();
        session::validate_protocol_id(&self.rules, protocol_id)?;
        session::validate_unit_id(&self.rules, unit_id)?;
        self.session.protocol_id = Some(protocol_id.to_string());
        self.session.unit_id = Some(unit_id.to_string());
        Ok(())
    }

    /// The start button: prepares a new unit and runs the pipeline.
    ///
    /// Returns `Ok(None)` when the operator cancels before anything runs.
    pub fn start_unit(&mut self) -> Result<Option<StepKind>, ControllerError> {
        self.ensure_idle()?;
        let images = self.images.clone().ok_or(ControllerError::AssetsNotReady)?;
        self.reset_session(self.session.variant);
        self.state = State::AssetsReady;

        let protocol_id = match self.session.protocol_id.clone() {
            Some(id) if self.session.continue_batch => id,
            _ => match self.with.prompt.ask(QUESTION_PROTOCOL_ID) {
                Some(id) => id,
                None => return Ok(self.cancelled()),
            },
        };
        let Some(unit_id) = self.with.prompt.ask(QUESTION_UNIT_ID) else {
            return Ok(self.cancelled());
        };
        if let Err(e) = self.set_identifiers(&protocol_id, &unit_id) {
            self.with.log.error(&e.to_string());
            return Err(e);
        }
        if !self.with.prompt.confirm(QUESTION_UNIT_INSERTED) {
            return Ok(self.cancelled());
        }
        if let Err(e) = self.stamp_unit_address(&images) {
            self.session.address = None;
            self.with.log.error(&format!("unit address not stored: {}", e));
            return Err(e);
        }

        self.indicate(Indicator::Busy);
        self.advance()
    }

    /// Dispatches the first step whose flag is not set.
    ///
    /// Returns the dispatched step, or `None` when the unit is finished or the
    /// final check failed.
    pub fn advance(&mut self) -> Result<Option<StepKind>, ControllerError> {
        self.ensure_idle()?;
        let images = self.images.clone().ok_or(ControllerError::AssetsNotReady)?;

        let Some(step) = self.session.checklist.first_unset() else {
            self.state = State::Finished;
            return Ok(None);
        };
        let Some(kind) = StepKind::for_step(step) else {
            self.final_check();
            return Ok(None);
        };
        if matches!(kind, StepKind::RadioFlash | StepKind::McuFlash) && self.session.address.is_none() {
            return Err(ControllerError::MissingAddress);
        }

        self.with.log.info(&format!("{} started", kind));
        let runner = Arc::clone(&self.runner);
        self.dispatch(kind, move || match kind {
            StepKind::PsuInit => runner.init_psu(),
            StepKind::RadioFlash => runner.program_radio(&images),
            StepKind::McuFlash => runner.program_mcu(&images),
            _ => runner.measure(),
        })?;
        Ok(Some(kind))
    }

    /// Re-runs the pipeline from the step that failed.
    pub fn retry_current(&mut self) -> Result<Option<StepKind>, ControllerError> {
        self.ensure_idle()?;
        if self.session.address.is_none() {
            return Err(ControllerError::MissingAddress);
        }
        let Some(step) = self.session.failed_step.take() else {
            return Err(ControllerError::NoFailedStep);
        };
        self.with.log.info(&format!("retrying {}", step));
        self.session.verdict = Verdict::Pending;
        self.state = self.progress_state();
        self.indicate(Indicator::Busy);
        self.advance()
    }

    // --- Event loop ---

    /// Handles at most one event, waiting up to `timeout` for it.
    pub fn poll(&mut self, timeout: Duration) -> Option<StationEvent> {
        match self.inbox.recv_timeout(timeout) {
            Ok(event) => {
                self.handle(event.clone());
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Handles events until no step is running. False on timeout.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight.is_some() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            self.poll(left);
        }
        true
    }

    pub fn handle(&mut self, event: StationEvent) {
        match event {
            StationEvent::Signal(signal) => self.on_signal(signal),
            StationEvent::Completed(done) => self.on_completed(done),
        }
    }

    /// Starts forwarding fixture signals to the inbox.
    pub fn start_listener(&self) -> Result<(), ControllerError> {
        let inbox = self.inbox_tx.clone();
        let forward = Box::new(move |signal: Signal| {
            let _ = inbox.send(StationEvent::Signal(signal));
        });
        self.runner.start_listener(forward).map_err(|e| {
            self.with.log.warn(&format!("fixture listener not started: {}", e));
            ControllerError::from(e)
        })
    }

    /// Powers the fixture down. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(kind) = self.in_flight {
            log::warn!("shutting down while {} is running", kind);
        }
        self.pool.shutdown();
        self.runner.shutdown();
        self.with.log.info("station shut down");
    }

    // --- Internals ---

    fn ensure_idle(&self) -> Result<(), ControllerError> {
        if self.in_flight.is_some() {
            Err(ControllerError::Busy)
        } else {
            Ok(())
        }
    }

    fn reset_session(&mut self, variant: Variant) {
        self.last_session += 1;
        self.session = self.session.next(self.last_session, variant);
    }

    /// Generates the unit address and writes it into the EEPROM records.
    fn stamp_unit_address(&mut self, images: &FirmwareImageSet) -> Result<(), ControllerError> {
        let address = self.generate_unit_address();
        let mut records = eeprom::load_records(&images.eeprom)?;
        eeprom::stamp_address(&mut records, &address)?;
        eeprom::save_records(&images.eeprom, &records)?;
        Ok(())
    }

    fn cancelled(&mut self) -> Option<StepKind> {
        self.with.log.warn("start cancelled by operator");
        None
    }

    /// State matching the last completed step.
    fn progress_state(&self) -> State {
        let list = self.session.checklist;
        [
            (Step::Measure, State::Measured),
            (Step::Stm, State::StmProgrammed),
            (Step::Esp, State::EspProgrammed),
            (Step::Psu, State::PsuInit),
        ]
        .into_iter()
        .find(|(step, _)| list.is_set(*step))
        .map(|(_, state)| state)
        .unwrap_or(State::AssetsReady)
    }

    fn dispatch<F>(&mut self, kind: StepKind, job: F) -> Result<(), ControllerError>
    where
        F: FnOnce() -> StepOutcome + Send + 'static,
    {
        let inbox = self.inbox_tx.clone();
        let session = self.session.id;
        self.pool
            .execute(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(job))
                    .unwrap_or_else(|_| StepOutcome::failure(format!("{} crashed", kind)));
                let _ = inbox.send(StationEvent::Completed(Completion { session, kind, outcome }));
            })
            .map_err(|_| ControllerError::PoolClosed)?;
        self.in_flight = Some(kind);
        Ok(())
    }

    fn indicate(&self, indicator: Indicator) {
        let runner = Arc::clone(&self.runner);
        if self.pool.execute(move || runner.indicate(indicator)).is_err() {
            log::warn!("indicator {:?} dropped, pool closed", indicator);
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::StartWork => self.with.log.info("start requested from the fixture"),
            Signal::NewDevice => self.with.log.info("new device placed in the fixture"),
            Signal::Unknown(payload) => self
                .with
                .log
                .log(&format!("unknown fixture signal {:02X?}", payload), Severity::Debug),
        }
    }

    fn on_completed(&mut self, done: Completion) {
        if done.session != self.session.id {
            log::debug!("dropping {} result of earlier session {}", done.kind, done.session);
            return;
        }
        if self.in_flight == Some(done.kind) {
            self.in_flight = None;
        }
        let outcome = done.outcome;

        match done.kind {
            StepKind::Assets => self.on_assets(outcome),
            StepKind::Save => self.on_saved(outcome),
            kind => {
                if !outcome.ok {
                    self.fail_step(kind, &outcome.detail);
                    if kind == StepKind::Measure {
                        self.session.failed_checks = outcome.failed_checks.clone();
                        self.save_record();
                    }
                    return;
                }
                let (step, state) = match kind {
                    StepKind::PsuInit => (Step::Psu, State::PsuInit),
                    StepKind::RadioFlash => (Step::Esp, State::EspProgrammed),
                    StepKind::McuFlash => (Step::Stm, State::StmProgrammed),
                    _ => (Step::Measure, State::Measured),
                };
                if kind == StepKind::RadioFlash {
                    self.session.radio_identity = outcome.identity.clone();
                }
                if kind == StepKind::Measure {
                    self.session.failed_checks.clear();
                }
                self.recovered();
                self.session.checklist.set(step);
                self.state = state;
                self.with.log.success(&outcome.detail);

                if let Err(e) = self.advance() {
                    self.with.log.error(&format!("pipeline stopped: {}", e));
                }
            }
        }
    }

    fn on_assets(&mut self, outcome: StepOutcome) {
        if !outcome.ok {
            self.state = State::Idle;
            self.with.log.error(&format!("asset fetch failed: {}", outcome.detail));
            return;
        }
        match self.provider.variant_config(self.session.variant) {
            Ok(resolved) => {
                self.images = Some(resolved.images);
                self.state = State::AssetsReady;
                self.with.log.success(&outcome.detail);
            }
            Err(e) => {
                self.state = State::Idle;
                self.with.log.error(&format!("asset fetch failed: {}", e));
            }
        }
    }

    fn on_saved(&mut self, outcome: StepOutcome) {
        if outcome.ok {
            self.with.log.success(&outcome.detail);
            return;
        }
        self.with.log.error(&format!("result save failed: {}", outcome.detail));
        if self.session.verdict == Verdict::Pass {
            // a retry runs the final check again and saves anew
            self.session.checklist.unset(Step::Finish);
            self.session.failed_step = Some(Step::Finish);
            self.session.verdict = Verdict::Fail;
            self.state = State::Failed;
            self.indicate(Indicator::Fail);
        }
    }

    /// Forgets an earlier failure once a step succeeds again.
    fn recovered(&mut self) {
        self.session.failed_step = None;
        if self.session.verdict == Verdict::Fail {
            self.session.verdict = Verdict::Pending;
        }
    }

    fn fail_step(&mut self, kind: StepKind, detail: &str) {
        let step = match kind {
            StepKind::PsuInit => Step::Psu,
            StepKind::RadioFlash => Step::Esp,
            StepKind::McuFlash => Step::Stm,
            _ => Step::Measure,
        };
        self.session.failed_step = Some(step);
        self.session.verdict = Verdict::Fail;
        self.state = State::Failed;
        self.with.log.error(detail);
        self.indicate(Indicator::Fail);
    }

    /// Last step: the operator confirms the display works.
    fn final_check(&mut self) {
        if !self.with.prompt.confirm(QUESTION_DISPLAY_LIT) {
            self.session.failed_step = Some(Step::Finish);
            self.session.verdict = Verdict::Fail;
            self.state = State::Failed;
            self.with.log.error("display check failed");
            self.indicate(Indicator::Fail);
            return;
        }

        self.session.checklist.set(Step::Finish);
        self.session.failed_step = None;
        self.session.verdict = Verdict::Pass;
        self.state = State::Finished;
        self.indicate(Indicator::Pass);
        self.with.log.success(&format!(
            "unit {} finished",
            self.session.unit_id.as_deref().unwrap_or("")
        ));
        self.save_record();
    }

    /// Stores the unit record with the current verdict in the background.
    fn save_record(&mut self) {
        let record = self.unit_record();
        let results = Arc::clone(&self.with.results);
        if let Err(e) = self.dispatch(StepKind::Save, move || match results.save(&record) {
            Ok(()) => StepOutcome::success(format!("record of unit {} saved", record.key())),
            Err(e) => StepOutcome::failure(e.to_string()),
        }) {
            self.with.log.error(&format!("result not saved: {}", e));
        }
    }

    fn unit_record(&self) -> UnitRecord {
        let s = &self.session;
        let (username, role) = match &self.operator {
            Some(op) => (op.name.clone(), op.role.clone()),
            None => (String::new(), String::new()),
        };
        UnitRecord {
            device: s.variant.label().to_string(),
            username,
            role,
            protocol: s.protocol_id.clone().unwrap_or_default(),
            desk_id: s.unit_id.clone().unwrap_or_default(),
            box_id: "none".to_string(),
            mac: s.address.clone().unwrap_or_default(),
            result: s.verdict.label().to_string(),
            date: chrono::Local::now().format("%Y.%m.%d %H:%M").to_string(),
            failed_checks: s.failed_checks.clone(),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collaborators::tests::RecordingLog;
    use crate::collaborators::SinkError;
    use crate::config::{StationConfig, VariantConfig};
    use crate::firmware::ImageSlot;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    /// Indicators are set off the controller thread; give them a moment.
    fn eventually(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Step runner answering from a script; unscripted steps succeed.
    #[derive(Default)]
    pub(crate) struct ScriptedSteps {
        pub script: Mutex<VecDeque<(StepKind, StepOutcome)>>,
        pub ran: Mutex<Vec<StepKind>>,
        pub indicators: Mutex<Vec<Indicator>>,
        pub shutdowns: Mutex<usize>,
    }

    impl ScriptedSteps {
        pub(crate) fn fail_once(self, kind: StepKind, detail: &str) -> Self {
            self.script.lock().unwrap().push_back((kind, StepOutcome::failure(detail)));
            self
        }

        pub(crate) fn ran(&self) -> Vec<StepKind> {
            self.ran.lock().unwrap().clone()
        }

        fn answer(&self, kind: StepKind) -> StepOutcome {
            self.ran.lock().unwrap().push(kind);
            let mut script = self.script.lock().unwrap();
            match script.iter().position(|(k, _)| *k == kind) {
                Some(i) => script.remove(i).map(|(_, o)| o).unwrap_or_default(),
                None => StepOutcome {
                    identity: (kind == StepKind::RadioFlash).then(|| "24:0a:c4:00:00:01".to_string()),
                    ..StepOutcome::success(format!("{} done", kind))
                },
            }
        }
    }

    impl StepRunner for ScriptedSteps {
        fn init_psu(&self) -> StepOutcome {
            self.answer(StepKind::PsuInit)
        }
        fn program_radio(&self, _: &FirmwareImageSet) -> StepOutcome {
            self.answer(StepKind::RadioFlash)
        }
        fn program_mcu(&self, _: &FirmwareImageSet) -> StepOutcome {
            self.answer(StepKind::McuFlash)
        }
        fn measure(&self) -> StepOutcome {
            self.answer(StepKind::Measure)
        }
        fn indicate(&self, indicator: Indicator) {
            self.indicators.lock().unwrap().push(indicator);
        }
        fn shutdown(&self) {
            *self.shutdowns.lock().unwrap() += 1;
        }
    }

    /// Answers prompts from a queue; confirmations default to yes.
    #[derive(Default)]
    pub(crate) struct CannedPrompt {
        pub answers: Mutex<VecDeque<Option<String>>>,
        pub confirms: Mutex<VecDeque<bool>>,
    }

    impl Prompt for CannedPrompt {
        fn confirm(&self, _question: &str) -> bool {
            self.confirms.lock().unwrap().pop_front().unwrap_or(true)
        }
        fn ask(&self, _question: &str) -> Option<String> {
            self.answers.lock().unwrap().pop_front().flatten()
        }
    }

    struct NoAssets;

    impl AssetFetcher for NoAssets {
        fn fetch(&self, _variant: Variant) -> Result<(), AssetError> {
            Ok(())
        }
    }

    /// Saved records; refuses to save while the flag is raised.
    #[derive(Default)]
    struct Records(Mutex<Vec<UnitRecord>>, AtomicBool);

    impl ResultSink for Records {
        fn save(&self, record: &UnitRecord) -> Result<(), SinkError> {
            if self.1.load(Ordering::SeqCst) {
                return Err(SinkError::Io {
                    path: PathBuf::from("results"),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct OneUser;

    impl CredentialCheck for OneUser {
        fn verify(&self, user: &str, secret: &str) -> Option<Operator> {
            (user == "jana" && secret == "1234").then(|| Operator {
                name: "jana".into(),
                role: "operator".into(),
            })
        }
    }

    /// Every variant maps to the same image set; only the EEPROM file is real.
    struct FixedImages(PathBuf);

    impl ConfigProvider for FixedImages {
        fn variant_config(&self, variant: Variant) -> Result<VariantConfig, ConfigError> {
            Ok(VariantConfig {
                variant,
                images: FirmwareImageSet {
                    radio: vec![ImageSlot::new("r.bin", 0); 4],
                    mcu: vec![ImageSlot::new("m.bin", 0); 3],
                    eeprom: self.0.clone(),
                },
            })
        }
    }

    struct Station {
        controller: Controller,
        steps: Arc<ScriptedSteps>,
        prompt: Arc<CannedPrompt>,
        log: Arc<RecordingLog>,
        records: Arc<Records>,
        eeprom: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn station(steps: ScriptedSteps) -> Station {
        let dir = tempfile::tempdir().unwrap();
        let eeprom = dir.path().join("eeprom.json");
        fs::write(
            &eeprom,
            r#"[{"name":"My TX EUI 1","address":"0x08080008","value":""}]"#,
        )
        .unwrap();

        let steps = Arc::new(steps);
        let prompt = Arc::new(CannedPrompt::default());
        let log = Arc::new(RecordingLog::default());
        let records = Arc::new(Records::default());
        let controller = Controller::new(
            Arc::new(FixedImages(eeprom.clone())),
            StationConfig::default().identifiers,
            steps.clone(),
            Collaborators {
                log: log.clone(),
                prompt: prompt.clone(),
                assets: Arc::new(NoAssets),
                results: records.clone(),
                credentials: Arc::new(OneUser),
            },
        );
        Station {
            controller,
            steps,
            prompt,
            log,
            records,
            eeprom,
            _dir: dir,
        }
    }

    fn ready(steps: ScriptedSteps) -> Station {
        let mut st = station(steps);
        st.controller.begin_unit(Variant::Gw100).unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::AssetsReady);
        st.controller.generate_unit_address();
        st.controller
            .set_identifiers("010H000000000580", "0312345678")
            .unwrap();
        st
    }

    // --- Pipeline order ---

    #[test]
    fn advance_visits_steps_in_order() {
        let mut st = ready(ScriptedSteps::default());
        assert_eq!(st.controller.advance().unwrap(), Some(StepKind::PsuInit));
        assert!(st.controller.run_until_idle(WAIT));

        assert_eq!(
            st.steps.ran(),
            vec![StepKind::PsuInit, StepKind::RadioFlash, StepKind::McuFlash, StepKind::Measure]
        );
        assert_eq!(st.controller.state(), State::Finished);
        assert!(st.controller.checklist().is_complete());
        assert_eq!(st.controller.session().verdict, Verdict::Pass);
        assert_eq!(
            st.controller.session().radio_identity.as_deref(),
            Some("24:0a:c4:00:00:01")
        );

        let saved = st.records.0.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].desk_id, "0312345678");
        assert_eq!(saved[0].result, "PASS");
        assert_eq!(saved[0].box_id, "none");
    }

    #[test]
    fn failed_step_is_repeated_not_skipped() {
        let mut st = ready(ScriptedSteps::default().fail_once(StepKind::McuFlash, "No ST-LINK detected!"));
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));

        assert_eq!(st.controller.state(), State::Failed);
        let list = st.controller.checklist();
        assert!(list.is_set(Step::Psu) && list.is_set(Step::Esp));
        assert!(!list.is_set(Step::Stm) && !list.is_set(Step::Measure));
        assert_eq!(st.log.messages(Severity::Error), vec!["No ST-LINK detected!"]);
        assert!(eventually(|| st.steps.indicators.lock().unwrap().last() == Some(&Indicator::Fail)));

        assert_eq!(st.controller.advance().unwrap(), Some(StepKind::McuFlash));
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::Finished);
        assert_eq!(
            st.steps.ran(),
            vec![
                StepKind::PsuInit,
                StepKind::RadioFlash,
                StepKind::McuFlash,
                StepKind::McuFlash,
                StepKind::Measure
            ]
        );
    }

    #[test]
    fn only_one_step_in_flight() {
        let mut st = ready(ScriptedSteps::default());
        st.controller.advance().unwrap();
        assert!(matches!(st.controller.advance(), Err(ControllerError::Busy)));
        assert!(matches!(st.controller.change_variant(Variant::Fm20), Err(ControllerError::Busy)));
        assert!(st.controller.run_until_idle(WAIT));
    }

    #[test]
    fn programming_needs_an_address() {
        let mut st = station(ScriptedSteps::default());
        st.controller.begin_unit(Variant::Gw100).unwrap();
        assert!(st.controller.run_until_idle(WAIT));

        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::PsuInit);
        assert_eq!(st.steps.ran(), vec![StepKind::PsuInit]);
        assert!(matches!(st.controller.advance(), Err(ControllerError::MissingAddress)));
    }

    #[test]
    fn advance_before_assets_is_refused() {
        let mut st = station(ScriptedSteps::default());
        assert!(matches!(st.controller.advance(), Err(ControllerError::AssetsNotReady)));
    }

    // --- Retry ---

    #[test]
    fn retry_resumes_at_failed_step() {
        let mut st = ready(ScriptedSteps::default().fail_once(StepKind::Measure, "failed checks: rise_edge"));
        assert!(matches!(st.controller.retry_current(), Err(ControllerError::NoFailedStep)));

        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.session().failed_step, Some(Step::Measure));
        assert_eq!(st.controller.session().verdict, Verdict::Fail);

        assert_eq!(st.controller.retry_current().unwrap(), Some(StepKind::Measure));
        assert_eq!(st.controller.state(), State::StmProgrammed);
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::Finished);
        assert_eq!(st.controller.session().verdict, Verdict::Pass);
    }

    #[test]
    fn advance_after_failure_clears_the_failed_step() {
        let mut st = ready(ScriptedSteps::default().fail_once(StepKind::RadioFlash, "A fatal error occurred"));
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.session().failed_step, Some(Step::Esp));

        assert_eq!(st.controller.advance().unwrap(), Some(StepKind::RadioFlash));
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::Finished);
        assert_eq!(st.controller.session().failed_step, None);
        assert_eq!(st.controller.session().verdict, Verdict::Pass);
    }

    #[test]
    fn retry_needs_an_address() {
        let mut st = station(ScriptedSteps::default());
        assert!(matches!(st.controller.retry_current(), Err(ControllerError::MissingAddress)));
    }

    #[test]
    fn failed_checks_reach_the_session() {
        let steps = ScriptedSteps::default();
        steps.script.lock().unwrap().push_back((
            StepKind::Measure,
            StepOutcome {
                failed_checks: vec!["battery_charging".into()],
                ..StepOutcome::failure("failed checks: battery_charging")
            },
        ));
        let mut st = ready(steps);
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.session().failed_checks, vec!["battery_charging"]);
    }

    #[test]
    fn failed_measurement_is_recorded_with_its_checks() {
        let steps = ScriptedSteps::default();
        steps.script.lock().unwrap().push_back((
            StepKind::Measure,
            StepOutcome {
                failed_checks: vec!["low_power_detection".into(), "max_power".into()],
                ..StepOutcome::failure("failed checks: low_power_detection, max_power")
            },
        ));
        let mut st = ready(steps);
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));

        assert_eq!(st.controller.state(), State::Failed);
        let saved = st.records.0.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].result, "FAIL");
        assert_eq!(saved[0].failed_checks, vec!["low_power_detection", "max_power"]);
    }

    // --- Final check ---

    #[test]
    fn dark_display_fails_the_unit_without_saving() {
        let mut st = ready(ScriptedSteps::default());
        st.prompt.confirms.lock().unwrap().push_back(false);
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));

        assert_eq!(st.controller.state(), State::Failed);
        assert_eq!(st.controller.session().verdict, Verdict::Fail);
        assert_eq!(st.controller.session().failed_step, Some(Step::Finish));
        assert!(st.records.0.lock().unwrap().is_empty());

        // retry only asks again
        st.controller.retry_current().unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::Finished);
        assert_eq!(st.steps.ran().len(), 4);
    }

    #[test]
    fn failed_save_fails_the_unit_and_retry_saves_again() {
        let mut st = ready(ScriptedSteps::default());
        st.records.1.store(true, Ordering::SeqCst);
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));

        assert_eq!(st.controller.state(), State::Failed);
        assert_eq!(st.controller.session().verdict, Verdict::Fail);
        assert_eq!(st.controller.session().failed_step, Some(Step::Finish));
        assert!(!st.controller.checklist().is_set(Step::Finish));
        let errors = st.log.messages(Severity::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("result save failed"));
        assert!(eventually(|| st.steps.indicators.lock().unwrap().contains(&Indicator::Fail)));

        st.records.1.store(false, Ordering::SeqCst);
        assert_eq!(st.controller.retry_current().unwrap(), None);
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::Finished);
        assert_eq!(st.controller.session().verdict, Verdict::Pass);
        let saved = st.records.0.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].result, "PASS");
    }

    // --- Variants and start ---

    #[test]
    fn same_variant_only_resets_checklist() {
        let mut st = ready(ScriptedSteps::default());
        st.controller.set_continue_batch(true);
        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));

        st.controller.change_variant(Variant::Gw100).unwrap();
        assert_eq!(st.controller.state(), State::AssetsReady);
        assert_eq!(st.controller.checklist(), Checklist::default());
        assert_eq!(st.controller.session().protocol_id.as_deref(), Some("010H000000000580"));
        assert_eq!(st.controller.session().unit_id, None);

        st.controller.change_variant(Variant::Fm20).unwrap();
        assert_eq!(st.controller.state(), State::Idle);
        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::AssetsReady);
        assert_eq!(st.controller.session().protocol_id, None);
    }

    #[test]
    fn start_unit_stamps_address_and_runs() {
        let mut st = ready(ScriptedSteps::default());
        st.prompt.answers.lock().unwrap().extend([
            Some("010H000000000581".to_string()),
            Some("0312345679".to_string()),
        ]);

        assert_eq!(st.controller.start_unit().unwrap(), Some(StepKind::PsuInit));
        let address = st.controller.session().address.clone().unwrap();
        let records = eeprom::load_records(&st.eeprom).unwrap();
        assert_eq!(records[0].value, serde_json::Value::String(address));

        assert!(st.controller.run_until_idle(WAIT));
        assert_eq!(st.controller.state(), State::Finished);
        assert!(eventually(|| st.steps.indicators.lock().unwrap().len() >= 2));
        assert_eq!(st.steps.indicators.lock().unwrap().first(), Some(&Indicator::Busy));
    }

    #[test]
    fn start_unit_rejects_bad_identifiers() {
        let mut st = ready(ScriptedSteps::default());
        st.prompt.answers.lock().unwrap().extend([
            Some("010H000000000581".to_string()),
            Some("0412345679".to_string()),
        ]);
        assert!(matches!(
            st.controller.start_unit(),
            Err(ControllerError::Validation(ValidationError::UnitId { .. }))
        ));
        assert!(!st.controller.is_busy());
        assert!(st.steps.ran().is_empty());
        assert_eq!(st.controller.session().address, None);
    }

    #[test]
    fn missing_eeprom_file_is_reported_and_blocks_start() {
        let mut st = ready(ScriptedSteps::default());
        fs::remove_file(&st.eeprom).unwrap();
        st.prompt.answers.lock().unwrap().extend([
            Some("010H000000000581".to_string()),
            Some("0312345679".to_string()),
        ]);

        assert!(matches!(st.controller.start_unit(), Err(ControllerError::Eeprom(_))));
        let errors = st.log.messages(Severity::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("unit address not stored"));
        assert_eq!(st.controller.session().address, None);
        assert!(!st.controller.is_busy());
        assert!(st.steps.ran().is_empty());
    }

    #[test]
    fn declining_insertion_cancels_before_dispatch() {
        let mut st = ready(ScriptedSteps::default());
        st.prompt.answers.lock().unwrap().extend([
            Some("010H000000000581".to_string()),
            Some("0312345679".to_string()),
        ]);
        st.prompt.confirms.lock().unwrap().push_back(false);
        assert_eq!(st.controller.start_unit().unwrap(), None);
        assert!(!st.controller.is_busy());
        assert_eq!(st.log.messages(Severity::Warning), vec!["start cancelled by operator"]);
        // nothing was stamped for the cancelled unit
        assert_eq!(st.controller.session().address, None);
        let records = eeprom::load_records(&st.eeprom).unwrap();
        assert_eq!(records[0].value, serde_json::Value::String(String::new()));
    }

    // --- Collaborators ---

    #[test]
    fn sign_in_sets_record_operator() {
        let mut st = ready(ScriptedSteps::default());
        assert!(matches!(st.controller.sign_in("jana", "x"), Err(ControllerError::Rejected(_))));
        st.controller.sign_in("jana", "1234").unwrap();

        st.controller.advance().unwrap();
        assert!(st.controller.run_until_idle(WAIT));
        let saved = st.records.0.lock().unwrap().clone();
        assert_eq!(saved[0].username, "jana");
        assert_eq!(saved[0].role, "operator");
    }

    #[test]
    fn signals_are_logged() {
        let mut st = station(ScriptedSteps::default());
        st.controller.events().send(StationEvent::Signal(Signal::StartWork)).unwrap();
        assert_eq!(
            st.controller.poll(WAIT),
            Some(StationEvent::Signal(Signal::StartWork))
        );
        assert_eq!(st.log.messages(Severity::Info), vec!["start requested from the fixture"]);
    }

    #[test]
    fn stale_completions_are_ignored() {
        let mut st = ready(ScriptedSteps::default());
        let old = st.controller.session().id - 1;
        st.controller.handle(StationEvent::Completed(Completion {
            session: old,
            kind: StepKind::PsuInit,
            outcome: StepOutcome::success("late"),
        }));
        assert_eq!(st.controller.checklist(), Checklist::default());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut st = station(ScriptedSteps::default());
        st.controller.shutdown();
        st.controller.shutdown();
        drop(st.controller);
        assert_eq!(*st.steps.shutdowns.lock().unwrap(), 1);
    }
}
