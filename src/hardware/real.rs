//! Physical HV rack: precision voltmeter + programmable calibrator.
//!
//! Both instruments speak SCPI over an [`ScpiLink`]. The voltmeter
//! (34401A class) is reset and configured for slow, high-resolution DC
//! readings; the calibrator (5502E class) is switched to operate and then
//! receives `OUT <native> V` setpoints, where the native value comes from
//! [`ScalingCoefficients::to_native`].
//!
//! Readings are raw divider-output volts and are multiplied by
//! `divider_factor` to get rack volts.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::HvBackend;
use crate::calibration::ScalingCoefficients;
use crate::config::RealConfig;
use crate::error::{AppResult, RackError};

/// Voltmeter configuration sequence, sent in order on initialize.
pub const VOLTMETER_INIT_SEQUENCE: [&str; 5] = [
    "*RST",
    "CONF:VOLT:DC 10,0.00001",
    "DET:BAND 3",
    "INP:IMP:AUTO ON",
    "VOLT:NPLC 100",
];

/// Puts the calibrator output in operate mode.
pub const CALIBRATOR_OPERATE: &str = "OPER";

/// Triggers and fetches one voltmeter reading.
pub const VOLTMETER_READ: &str = "READ?";

/// A line-oriented SCPI connection to one instrument.
#[async_trait]
pub trait ScpiLink: Send {
    /// Sends one command. The terminator is appended by the link.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Reads one response line, without the terminator.
    async fn read(&mut self) -> AppResult<String>;

    /// Resource name for logs.
    fn resource(&self) -> &str;
}

/// [`HvBackend`] over two SCPI links.
pub struct RealBackend {
    config: RealConfig,
    scaling: ScalingCoefficients,
    voltmeter: Mutex<Box<dyn ScpiLink>>,
    calibrator: Mutex<Box<dyn ScpiLink>>,
}

impl RealBackend {
    /// Wraps already-opened links.
    pub fn new(
        config: RealConfig,
        voltmeter: Box<dyn ScpiLink>,
        calibrator: Box<dyn ScpiLink>,
    ) -> Self {
        Self {
            scaling: config.scaling,
            config,
            voltmeter: Mutex::new(voltmeter),
            calibrator: Mutex::new(calibrator),
        }
    }

    fn settle(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }
}

impl std::fmt::Debug for RealBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealBackend")
            .field("voltmeter", &self.config.voltmeter_resource)
            .field("calibrator", &self.config.calibrator_resource)
            .field("scaling", &self.scaling)
            .finish()
    }
}

#[async_trait]
impl HvBackend for RealBackend {
    async fn initialize(&self) -> AppResult<()> {
        {
            let mut voltmeter = self.voltmeter.lock().await;
            info!(resource = voltmeter.resource(), "Initializing voltmeter");
            for command in VOLTMETER_INIT_SEQUENCE {
                debug!(command, "voltmeter <-");
                voltmeter.write(command).await?;
                sleep(Self::settle(self.config.init_settle_ms)).await;
            }
            info!("Voltmeter initialization done");
        }

        let mut calibrator = self.calibrator.lock().await;
        info!(resource = calibrator.resource(), "Initializing calibrator");
        debug!(command = CALIBRATOR_OPERATE, "calibrator <-");
        calibrator.write(CALIBRATOR_OPERATE).await?;
        sleep(Self::settle(self.config.calibrator_init_settle_ms)).await;
        info!("Calibrator initialization done");
        Ok(())
    }

    async fn shutdown(&self) -> AppResult<()> {
        // Fetch the pending reading so the meter does not complain on the next start.
        let mut voltmeter = self.voltmeter.lock().await;
        match voltmeter.read().await {
            Ok(pending) => debug!(pending = %pending, "Drained pending voltmeter reading"),
            Err(e) => warn!(error = %e, "No pending voltmeter reading to drain"),
        }
        info!("Real rack stopped");
        Ok(())
    }

    async fn apply_setpoint(&self, voltage: f64) -> AppResult<()> {
        let native = self.scaling.to_native(voltage);
        let command = format!("OUT {native} V");
        let mut calibrator = self.calibrator.lock().await;
        debug!(voltage, native, "calibrator <- {command}");
        calibrator.write(&command).await?;
        sleep(Self::settle(self.config.setpoint_settle_ms)).await;
        Ok(())
    }

    async fn read_measured_voltage(&self) -> AppResult<f64> {
        let mut voltmeter = self.voltmeter.lock().await;
        voltmeter.write(VOLTMETER_READ).await?;
        sleep(Self::settle(self.config.read_settle_ms)).await;
        let response = voltmeter.read().await?;
        let raw: f64 = response.trim().parse().map_err(|_| {
            RackError::Instrument(format!(
                "{} returned a non-numeric reading: {response:?}",
                voltmeter.resource()
            ))
        })?;
        let voltage = raw * self.config.divider_factor;
        debug!(raw, voltage, "voltmeter reading");
        Ok(voltage)
    }

    fn describe(&self) -> String {
        format!(
            "real(voltmeter={}, calibrator={})",
            self.config.voltmeter_resource, self.config.calibrator_resource
        )
    }
}

/// In-memory [`ScpiLink`] that records writes and replays queued responses.
///
/// Clones share the same script, so a test can keep one handle for
/// inspection while the backend owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLink {
    resource: String,
    script: Arc<std::sync::Mutex<Script>>,
}

#[derive(Debug, Default)]
struct Script {
    written: Vec<String>,
    responses: std::collections::VecDeque<String>,
}

impl ScriptedLink {
    /// Creates an empty script for `resource`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            script: Arc::default(),
        }
    }

    /// Queues a response for the next `read`.
    pub fn push_response(&self, response: impl Into<String>) {
        self.lock().responses.push_back(response.into());
    }

    /// Every command written so far.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ScpiLink for ScriptedLink {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.lock().written.push(command.to_string());
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        self.lock().responses.pop_front().ok_or_else(|| {
            RackError::Instrument(format!("{}: read timed out", self.resource))
        })
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn fast_config() -> RealConfig {
        RealConfig {
            init_settle_ms: 1000,
            calibrator_init_settle_ms: 2000,
            setpoint_settle_ms: 2000,
            read_settle_ms: 4000,
            scaling: ScalingCoefficients { a: 350.0, b: 0.0 },
            divider_factor: 1000.0,
            ..RealConfig::default()
        }
    }

    fn backend() -> (RealBackend, ScriptedLink, ScriptedLink) {
        let voltmeter = ScriptedLink::new("GPIB::20::INSTR");
        let calibrator = ScriptedLink::new("GPIB::4::INSTR");
        let backend = RealBackend::new(
            fast_config(),
            Box::new(voltmeter.clone()),
            Box::new(calibrator.clone()),
        );
        (backend, voltmeter, calibrator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sends_sequences_with_settle_times() {
        let (backend, voltmeter, calibrator) = backend();
        let start = tokio::time::Instant::now();
        backend.initialize().await.unwrap();

        assert_eq!(voltmeter.written(), VOLTMETER_INIT_SEQUENCE.to_vec());
        assert_eq!(calibrator.written(), vec!["OPER".to_string()]);
        // 5 x 1 s voltmeter settle + 2 s calibrator settle.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_setpoint_rescales_and_clamps() {
        let (backend, _voltmeter, calibrator) = backend();
        backend.apply_setpoint(700.0).await.unwrap();
        backend.apply_setpoint(1.0e6).await.unwrap();
        backend.apply_setpoint(-5.0).await.unwrap();
        assert_eq!(
            calibrator.written(),
            vec!["OUT 2 V".to_string(), "OUT 10 V".to_string(), "OUT 0 V".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_scales_by_divider() {
        let (backend, voltmeter, _calibrator) = backend();
        voltmeter.push_response("+1.50000000E+00\n");
        let start = tokio::time::Instant::now();
        let v = backend.read_measured_voltage().await.unwrap();
        assert!((v - 1500.0).abs() < 1e-9);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(voltmeter.written(), vec!["READ?".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_reading_is_instrument_error() {
        let (backend, voltmeter, _calibrator) = backend();
        voltmeter.push_response("OVLD");
        let err = backend.read_measured_voltage().await.unwrap_err();
        assert!(matches!(err, RackError::Instrument(_)));
        assert!(err.to_string().contains("GPIB::20::INSTR"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_shutdown_drains_and_never_fails() {
        let (backend, voltmeter, _calibrator) = backend();
        voltmeter.push_response("+0.0");
        backend.shutdown().await.unwrap();
        assert!(!logs_contain("No pending voltmeter reading"));
        // Nothing pending the second time; still Ok.
        backend.shutdown().await.unwrap();
        assert!(logs_contain("No pending voltmeter reading"));
    }
}
