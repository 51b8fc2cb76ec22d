//! Tick conductor, signal units, and program catalog for the traffic light
//! simulation.
//!
//! A single timer publishes numbered ticks; one worker task per signal
//! unit consumes every tick exactly once and advances its unit's phase
//! program. Paired units share a program but start at complementary
//! phases, so both heads of a crossing stay consistent.
//!
//! # Modules
//!
//! - [`catalog`] -- Stock and configured programs keyed by variant.
//! - [`conductor`] -- [`Conductor`]: lifecycle, tick timer, program
//!   switching, and bounded shutdown.
//! - [`config`] -- Configuration loading from `trafficlight-config.yaml`
//!   into strongly-typed structs.
//! - [`control`] -- Lifecycle states and runtime-adjustable tick speed.
//! - [`diagnostics`] -- Non-fatal events published to subscribers.
//! - [`sink`] -- [`OutputSink`] trait and the logging and recording sinks.
//! - [`unit`] -- [`SignalUnit`]: one signal head's phase state machine.
//!
//! [`Conductor`]: conductor::Conductor
//! [`OutputSink`]: sink::OutputSink
//! [`SignalUnit`]: unit::SignalUnit

pub mod catalog;
pub mod conductor;
pub mod config;
pub mod control;
pub mod diagnostics;
pub mod sink;
mod tick;
pub mod unit;
mod worker;

pub use catalog::{CatalogError, ProgramCatalog, VariantPlan};
pub use conductor::{Conductor, ConductorError, ConductorSettings, ConductorStatus, UnitStatus};
pub use config::{ConfigError, TrafficlightConfig};
pub use control::Lifecycle;
pub use diagnostics::Diagnostic;
pub use sink::{OutputSink, RecordingSink, SinkError, TracingSink};
pub use unit::{SignalUnit, UnitError, UnitSnapshot};
