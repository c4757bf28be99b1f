//! # Production Station Core
//!
//! This library drives the production test station: the fixture's control
//! board over its framed serial protocol, the bench supply over SCPI, the two
//! chip programmers and the state machine that walks every unit through
//! power-up, programming, electrical checks and the final verdict.
//!
//! The hardware layers are usable on their own; [`controller::Controller`]
//! ties them together and talks to the outside world only through the
//! traits in [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod crc8;
pub mod eeprom;
pub mod firmware;
pub mod fixture;
pub mod mcu_flasher;
pub mod psu;
pub mod radio_flasher;
pub mod rf;
pub mod sequencer;
pub mod session;
pub mod worker;

pub use collaborators::{LogSink, Severity};
pub use config::{ConfigProvider, StationConfig};
pub use controller::{Collaborators, Controller, ControllerError, State, StationEvent, StepKind};
pub use fixture::{Fixture, Indicator, StepOutcome, StepRunner};
pub use session::{Session, Step, Variant, Verdict};
