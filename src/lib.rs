//! Core library for the HV rack server.
//!
//! This library contains the command/telemetry coordinator, the hardware
//! backends (physical instruments and a simulator), the reply fan-out hub,
//! persistence and the client transports. It is used by the
//! `hv-rack-server` binary and by the integration tests.

pub mod calibration;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hardware;
pub mod hub;
pub mod logging;
pub mod messages;
pub mod storage;
pub mod transport;
pub mod validation;

pub use config::Settings;
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorState};
pub use error::{AppResult, RackError};
pub use hub::TelemetryHub;
