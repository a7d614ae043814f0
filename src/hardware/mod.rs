//! Hardware backends for the HV rack.
//!
//! The coordinator only sees [`HvBackend`]. Two implementations exist:
//!
//! - [`simulated::SimulatedBackend`] ramps a virtual measured voltage toward the
//!   requested setpoint. Used for development and all timing tests.
//! - [`real::RealBackend`] drives a precision voltmeter and a programmable
//!   calibrator over [`real::ScpiLink`]s. The VISA link lives in [`visa`] and is
//!   compiled only with `--features instrument_visa`.
//!
//! Both variants converge the measured voltage toward the last setpoint under
//! repeated polling, which is all the coordinator relies on.

pub mod real;
pub mod simulated;
pub mod visa;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{BackendMode, HardwareConfig};
use crate::error::AppResult;

pub use real::{RealBackend, ScpiLink};
pub use simulated::SimulatedBackend;

/// Capability set of a rack backend.
///
/// Implementations are shared between the telemetry loop and the command task,
/// so every method takes `&self`. The coordinator guarantees that at most one
/// `apply_setpoint` is in flight; `read_measured_voltage` may run concurrently
/// with it.
#[async_trait]
pub trait HvBackend: Send + Sync {
    /// Brings instruments into a known state. Failure is fatal at startup.
    async fn initialize(&self) -> AppResult<()>;

    /// Releases instruments. Called once when the coordinator stops.
    async fn shutdown(&self) -> AppResult<()>;

    /// Drives the supply toward `voltage` and returns once the instrument
    /// acknowledged the new setpoint.
    async fn apply_setpoint(&self, voltage: f64) -> AppResult<()>;

    /// Takes one reading. The call itself paces telemetry.
    async fn read_measured_voltage(&self) -> AppResult<f64>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Builds the backend selected by `config.mode`.
///
/// Real mode opens both instrument links here; a link that cannot be opened
/// aborts startup.
pub async fn build_backend(config: &HardwareConfig) -> AppResult<Arc<dyn HvBackend>> {
    let backend: Arc<dyn HvBackend> = match config.mode {
        BackendMode::Simulated => Arc::new(SimulatedBackend::new(config.simulated.clone())),
        BackendMode::Real => {
            let voltmeter =
                visa::open_link(&config.real.voltmeter_resource, config.real.io_timeout_ms).await?;
            let calibrator =
                visa::open_link(&config.real.calibrator_resource, config.real.io_timeout_ms)
                    .await?;
            Arc::new(RealBackend::new(config.real.clone(), voltmeter, calibrator))
        }
    };
    info!(backend = %backend.describe(), "Hardware backend created");
    Ok(backend)
}
