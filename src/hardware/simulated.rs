//! Simulated HV rack.
//!
//! `apply_setpoint` only records the target. A background ramp task moves the
//! measured voltage toward it once per tick by at most `ramp_rate` volts plus a
//! uniform jitter in `[-jitter, jitter]`. With `jitter <= ramp_rate` the value
//! never overshoots the target by more than one tick's movement.
//!
//! All delays use `tokio::time`, so tests can run with paused time.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::HvBackend;
use crate::config::SimulatedConfig;
use crate::error::AppResult;

#[derive(Debug)]
struct RampState {
    measured: f64,
    target: f64,
    rng: StdRng,
}

impl RampState {
    fn step(&mut self, rate: f64, jitter: f64) {
        let delta = self.target - self.measured;
        let movement = delta.signum() * rate.min(delta.abs());
        let noise = if jitter > 0.0 {
            self.rng.gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        self.measured += movement + noise;
    }
}

/// Ramp simulator implementing [`HvBackend`].
#[derive(Debug)]
pub struct SimulatedBackend {
    config: SimulatedConfig,
    state: Arc<Mutex<RampState>>,
    ramp: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SimulatedBackend {
    /// Creates a simulator at `config.initial_voltage`. The ramp starts on
    /// [`HvBackend::initialize`].
    pub fn new(config: SimulatedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = RampState {
            measured: config.initial_voltage,
            target: config.initial_voltage,
            rng,
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            ramp: Mutex::new(None),
        }
    }

    /// Current simulated voltage, without the read delay.
    pub fn peek_measured(&self) -> f64 {
        lock(&self.state).measured
    }

    /// Last recorded setpoint.
    pub fn target(&self) -> f64 {
        lock(&self.state).target
    }

    /// Whether the ramp task is running.
    pub fn is_ramping(&self) -> bool {
        lock(&self.ramp).is_some()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl HvBackend for SimulatedBackend {
    async fn initialize(&self) -> AppResult<()> {
        let mut ramp = lock(&self.ramp);
        if ramp.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let state = Arc::clone(&self.state);
        let rate = self.config.ramp_rate;
        let jitter = self.config.jitter.min(rate);
        let tick = self.config.tick();
        let child = token.clone();
        // Anchored here so the cadence does not depend on when the task is first polled.
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => lock(&state).step(rate, jitter),
                }
            }
            debug!("Simulated ramp stopped");
        });

        *ramp = Some((token, handle));
        info!(
            ramp_rate = rate,
            tick_ms = self.config.tick_ms,
            "Simulated rack initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> AppResult<()> {
        let ramp = lock(&self.ramp).take();
        if let Some((token, handle)) = ramp {
            token.cancel();
            let _ = handle.await;
            info!("Simulated rack stopped");
        }
        Ok(())
    }

    async fn apply_setpoint(&self, voltage: f64) -> AppResult<()> {
        lock(&self.state).target = voltage;
        debug!(voltage, "Simulated setpoint recorded");
        sleep(self.config.setpoint_ack()).await;
        Ok(())
    }

    async fn read_measured_voltage(&self) -> AppResult<f64> {
        sleep(self.config.read_interval()).await;
        Ok(self.peek_measured())
    }

    fn describe(&self) -> String {
        format!(
            "simulated({} V/tick every {} ms)",
            self.config.ramp_rate, self.config.tick_ms
        )
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        if let Some((token, handle)) = lock(&self.ramp).take() {
            token.cancel();
            handle.abort();
        }
    }
}
