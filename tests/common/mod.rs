//! Common test utilities for hv_rack integration tests
//!
//! - Simulator and coordinator configs tuned for paused-time tests
//! - In-memory sink and scriptable fault-injecting backends
//! - Helpers that wait for a specific reply while skipping telemetry

#![allow(dead_code)] // Not every test binary uses every helper

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hv_rack::config::{CoordinatorConfig, SimulatedConfig};
use hv_rack::error::{AppResult, RackError};
use hv_rack::hardware::{HvBackend, SimulatedBackend};
use hv_rack::hub::Subscription;
use hv_rack::messages::{AnswerKind, ErrorCode, RawCommand, Reply};
use hv_rack::storage::MeasurementSink;
use hv_rack::{Coordinator, TelemetryHub};

/// Deterministic simulator: no jitter, fixed seed, starting at 0 V.
pub fn sim_config(ramp_rate: f64) -> SimulatedConfig {
    SimulatedConfig {
        ramp_rate,
        tick_ms: 1000,
        jitter: 0.0,
        setpoint_ack_ms: 2000,
        read_interval_ms: 1000,
        seed: Some(7),
        initial_voltage: 0.0,
    }
}

/// Coordinator with the default one-second poll and backoff.
pub fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        convergence_poll_ms: 1000,
        telemetry_error_backoff_ms: 1000,
    }
}

/// A coordinator over a deterministic simulator ramping `ramp_rate` V per second.
pub fn simulated_coordinator(ramp_rate: f64) -> Coordinator {
    let backend = Arc::new(SimulatedBackend::new(sim_config(ramp_rate)));
    Coordinator::new(coordinator_config(), backend, TelemetryHub::new(1024), None)
}

/// Builds a raw command from a JSON meta object.
pub fn command(meta: Value) -> RawCommand {
    RawCommand::from_meta(meta).expect("test command must be an object with command_type")
}

/// `set_voltage` command.
pub fn set_voltage(voltage: f64) -> RawCommand {
    command(json!({"command_type": "set_voltage", "voltage": voltage}))
}

/// `set_voltage_and_check` command.
pub fn set_voltage_and_check(voltage: f64, max_error: f64, timeout_secs: f64) -> RawCommand {
    command(json!({
        "command_type": "set_voltage_and_check",
        "voltage": voltage,
        "max_error": max_error,
        "timeout": timeout_secs,
    }))
}

/// Waits (in virtual time when paused) for the first reply matching `pred`.
///
/// # Panics
/// Panics if nothing matches within `within`, or the subscription closes.
pub async fn next_matching<F>(sub: &mut Subscription, within: Duration, pred: F) -> Arc<Reply>
where
    F: Fn(&Reply) -> bool,
{
    let wait = async {
        loop {
            let reply = sub.recv().await.expect("subscription closed");
            if pred(&reply) {
                return reply;
            }
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .unwrap_or_else(|_| panic!("no matching reply within {within:?}"))
}

/// Waits for the first non-telemetry reply.
pub async fn next_non_telemetry(sub: &mut Subscription, within: Duration) -> Arc<Reply> {
    next_matching(sub, within, |r| r.answer_kind() != Some(AnswerKind::GetVoltage)).await
}

/// Waits for an error reply with `code`.
pub async fn next_error(sub: &mut Subscription, code: ErrorCode, within: Duration) -> Arc<Reply> {
    next_matching(sub, within, |r| r.error_code() == Some(code)).await
}

/// Sink that keeps every value in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    values: Arc<Mutex<Vec<f64>>>,
}

impl MemorySink {
    /// Values written so far.
    pub fn values(&self) -> Vec<f64> {
        self.values.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeasurementSink for MemorySink {
    async fn write(&mut self, value: f64) -> AppResult<()> {
        self.values.lock().unwrap().push(value);
        Ok(())
    }
}

/// How [`FaultyBackend`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Behaves.
    None,
    /// `initialize` fails.
    Init,
    /// `initialize` takes ten seconds.
    SlowInit,
    /// The first `n` reads fail.
    ReadErrors(usize),
    /// The first read panics.
    ReadPanic,
    /// `apply_setpoint` fails.
    Apply,
    /// `apply_setpoint` panics.
    ApplyPanic,
}

/// Backend with a fixed reading that can be told to fail.
///
/// Each read takes `read_interval`; setpoints are acknowledged after `ack`.
#[derive(Debug)]
pub struct FaultyBackend {
    fault: Fault,
    reading: Mutex<f64>,
    read_interval: Duration,
    ack: Duration,
    pub reads: AtomicUsize,
    pub applies: AtomicUsize,
    pub initializes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            reading: Mutex::new(0.0),
            read_interval: Duration::from_secs(1),
            ack: Duration::from_millis(500),
            reads: AtomicUsize::new(0),
            applies: AtomicUsize::new(0),
            initializes: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HvBackend for FaultyBackend {
    async fn initialize(&self) -> AppResult<()> {
        self.initializes.fetch_add(1, Ordering::SeqCst);
        if self.fault == Fault::SlowInit {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        if self.fault == Fault::Init {
            return Err(RackError::InstrumentConnect {
                resource: "GPIB::20::INSTR".into(),
                reason: "no listener".into(),
            });
        }
        Ok(())
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_setpoint(&self, voltage: f64) -> AppResult<()> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.ack).await;
        match self.fault {
            Fault::Apply => Err(RackError::Instrument("calibrator rejected OUT".into())),
            Fault::ApplyPanic => panic!("calibrator driver bug"),
            _ => {
                *self.reading.lock().unwrap() = voltage;
                Ok(())
            }
        }
    }

    async fn read_measured_voltage(&self) -> AppResult<f64> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.read_interval).await;
        match self.fault {
            Fault::ReadErrors(failing) if n < failing => {
                Err(RackError::Instrument("voltmeter read timed out".into()))
            }
            Fault::ReadPanic if n == 0 => panic!("voltmeter driver bug"),
            _ => Ok(*self.reading.lock().unwrap()),
        }
    }

    fn describe(&self) -> String {
        format!("faulty ({:?})", self.fault)
    }
}
