//! Configuration system using Figment
//!
//! Configuration is layered from (lowest to highest precedence):
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/hv_rack.toml` unless another path is given)
//! 3. Environment variables prefixed with `HV_RACK_`
//!
//! # Environment Variable Overrides
//!
//! Sections are separated with a double underscore:
//!
//! ```text
//! HV_RACK_APPLICATION__LOG_LEVEL=debug
//! HV_RACK_HARDWARE__MODE=real
//! HV_RACK_SERVER__TCP_PORT=5556
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calibration::ScalingCoefficients;
use crate::error::{AppResult, RackError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/hv_rack.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HV_RACK_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Command/telemetry coordinator timing
    pub coordinator: CoordinatorConfig,
    /// Reply fan-out settings
    pub hub: HubConfig,
    /// Hardware backend selection and constants
    pub hardware: HardwareConfig,
    /// Client-facing listeners
    pub server: ServerConfig,
    /// Measurement log settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Optional log file, appended to alongside console output
    pub log_file: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "hv-rack".to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Coordinator timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How often a checked setpoint re-reads the measured voltage
    pub convergence_poll_ms: u64,
    /// Pause after a failed telemetry read before retrying
    pub telemetry_error_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            convergence_poll_ms: 1000,
            telemetry_error_backoff_ms: 1000,
        }
    }
}

impl CoordinatorConfig {
    /// Convergence poll period.
    pub fn convergence_poll(&self) -> Duration {
        Duration::from_millis(self.convergence_poll_ms)
    }

    /// Telemetry retry pause.
    pub fn telemetry_error_backoff(&self) -> Duration {
        Duration::from_millis(self.telemetry_error_backoff_ms)
    }
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Bounded queue length per subscriber
    pub subscriber_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
        }
    }
}

/// Backend variant
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Physical voltmeter + calibrator
    Real,
    /// Deterministic ramp simulator
    #[default]
    Simulated,
}

/// Hardware configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    /// Which backend to build
    pub mode: BackendMode,
    /// Simulator constants
    pub simulated: SimulatedConfig,
    /// Physical instrument constants
    pub real: RealConfig,
}

/// Simulated backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Maximum movement of the measured voltage per tick, in volts
    pub ramp_rate: f64,
    /// Ramp tick period
    pub tick_ms: u64,
    /// Uniform jitter amplitude added each tick, in volts
    pub jitter: f64,
    /// Time the simulated calibrator takes to acknowledge a setpoint
    pub setpoint_ack_ms: u64,
    /// Time one simulated voltmeter reading takes
    pub read_interval_ms: u64,
    /// Seed for the jitter generator; random when absent
    pub seed: Option<u64>,
    /// Measured voltage at startup
    pub initial_voltage: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            ramp_rate: 100.0,
            tick_ms: 1000,
            jitter: 0.5,
            setpoint_ack_ms: 2000,
            read_interval_ms: 1000,
            seed: None,
            initial_voltage: 0.0,
        }
    }
}

impl SimulatedConfig {
    /// Ramp tick period.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Setpoint acknowledgement delay.
    pub fn setpoint_ack(&self) -> Duration {
        Duration::from_millis(self.setpoint_ack_ms)
    }

    /// Reading period.
    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }
}

/// Real backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealConfig {
    /// VISA resource of the precision voltmeter
    pub voltmeter_resource: String,
    /// VISA resource of the programmable calibrator
    pub calibrator_resource: String,
    /// Link I/O timeout
    pub io_timeout_ms: u64,
    /// HV divider ratio applied to raw voltmeter readings
    pub divider_factor: f64,
    /// Rack volts → calibrator native units
    pub scaling: ScalingCoefficients,
    /// Settle time after each voltmeter configuration command
    pub init_settle_ms: u64,
    /// Settle time after switching the calibrator to operate
    pub calibrator_init_settle_ms: u64,
    /// Settle time after writing a setpoint
    pub setpoint_settle_ms: u64,
    /// Integration time between `READ?` and reading the result
    pub read_settle_ms: u64,
}

impl Default for RealConfig {
    fn default() -> Self {
        Self {
            voltmeter_resource: "GPIB::20::INSTR".to_string(),
            calibrator_resource: "GPIB::4::INSTR".to_string(),
            io_timeout_ms: 5000,
            divider_factor: 1000.0,
            scaling: ScalingCoefficients::default(),
            init_settle_ms: 1000,
            calibrator_init_settle_ms: 2000,
            setpoint_settle_ms: 2000,
            read_settle_ms: 4000,
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Binary envelope interface host
    pub tcp_host: String,
    /// Binary envelope interface port
    pub tcp_port: u16,
    /// WebSocket interface host
    pub ws_host: String,
    /// WebSocket interface port
    pub ws_port: u16,
    /// Whether to start the WebSocket interface
    pub ws_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_host: "0.0.0.0".to_string(),
            tcp_port: 5555,
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8080,
            ws_enabled: true,
        }
    }
}

impl ServerConfig {
    /// `host:port` of the TCP interface.
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.tcp_host, self.tcp_port)
    }

    /// `host:port` of the WebSocket interface.
    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }
}

/// Measurement log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Whether telemetry is persisted
    pub enabled: bool,
    /// Root directory of the local database
    pub root: PathBuf,
    /// Column/directory name of the persisted quantity
    pub control_name: String,
    /// Shell command that synchronises the local database
    pub sync_command: Option<String>,
    /// Period of the sync command
    pub sync_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("./db"),
            control_name: "HV".to_string(),
            sync_command: None,
            sync_interval_secs: 3600,
        }
    }
}

impl Settings {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment still apply.
    /// After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Self::extract_from(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Merge defaults, the file at `path` and the environment without validating.
    ///
    /// For callers that apply overrides (e.g. command-line flags) before
    /// calling [`Settings::validate`] themselves.
    pub fn extract_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Queue capacity and periods are non-zero
    /// - Simulator jitter cannot outrun the ramp
    /// - Divider and scaling coefficients are usable
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RackError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.hub.subscriber_queue_capacity == 0 {
            return Err(RackError::Configuration(
                "hub.subscriber_queue_capacity must be > 0".to_string(),
            ));
        }

        if self.coordinator.convergence_poll_ms == 0 {
            return Err(RackError::Configuration(
                "coordinator.convergence_poll_ms must be > 0".to_string(),
            ));
        }

        let sim = &self.hardware.simulated;
        if !(sim.ramp_rate.is_finite() && sim.ramp_rate > 0.0) {
            return Err(RackError::Configuration(format!(
                "hardware.simulated.ramp_rate must be a positive number, got {}",
                sim.ramp_rate
            )));
        }
        if !(sim.jitter.is_finite() && sim.jitter >= 0.0 && sim.jitter <= sim.ramp_rate) {
            return Err(RackError::Configuration(format!(
                "hardware.simulated.jitter must be within [0, ramp_rate], got {}",
                sim.jitter
            )));
        }
        if sim.tick_ms == 0 {
            return Err(RackError::Configuration(
                "hardware.simulated.tick_ms must be > 0".to_string(),
            ));
        }

        let real = &self.hardware.real;
        if !(real.divider_factor.is_finite() && real.divider_factor > 0.0) {
            return Err(RackError::Configuration(format!(
                "hardware.real.divider_factor must be a positive number, got {}",
                real.divider_factor
            )));
        }
        real.scaling.validate()?;
        if self.hardware.mode == BackendMode::Real {
            if real.voltmeter_resource.is_empty() {
                return Err(RackError::Configuration(
                    "hardware.real.voltmeter_resource cannot be empty".to_string(),
                ));
            }
            if real.calibrator_resource.is_empty() {
                return Err(RackError::Configuration(
                    "hardware.real.calibrator_resource cannot be empty".to_string(),
                ));
            }
        }

        if self.storage.enabled && self.storage.control_name.trim().is_empty() {
            return Err(RackError::Configuration(
                "storage.control_name cannot be empty".to_string(),
            ));
        }
        if self.storage.sync_interval_secs == 0 {
            return Err(RackError::Configuration(
                "storage.sync_interval_secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
