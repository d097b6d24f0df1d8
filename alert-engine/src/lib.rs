//! Floor environment alert engine.
//!
//! Evaluates temperature, humidity and energy readings per building floor,
//! opens de-duplicated alerts and attaches an actionable recommendation to
//! each one. Storage is abstracted behind the traits in [`store`] with a
//! Postgres implementation in [`pg`] and an in-memory one in [`memory`].

pub mod dedup;
pub mod generator;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod pg;
pub mod recommend;
pub mod store;
pub mod threshold;

pub use lifecycle::{AlertManager, EngineConfig, MeasurementReport, StatusUpdateError};
pub use model::{Alert, AlertStatus, Floor, Measurement, Variable};
pub use threshold::{Evaluator, FloorStatus, Severity, ThresholdDefaults};
