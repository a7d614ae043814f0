//! # Command/telemetry coordinator
//!
//! The coordinator owns the backend and the [`VoltageState`], and runs two
//! long-lived tasks:
//!
//! - **intake loop**: drains the unbounded intake queue in arrival order,
//!   validates each submission and either launches it or rejects it as busy.
//!   Rejections never wait for hardware.
//! - **telemetry loop**: polls the backend forever, updating `measured`,
//!   persisting and publishing every reading.
//!
//! ```text
//!  transports ──submit──► [intake] ──validate──► busy? ──yes──► SERVER_BUSY_ERROR
//!                                                   │no
//!                                                   ▼
//!                                           command task (≤ 1) ──► hub.publish
//!  backend ◄──read── telemetry loop ──► measured, sink, hub.publish
//! ```
//!
//! At most one command executes at a time. The busy flag is held by an RAII
//! guard inside the command task, so neither errors, panics nor cancellation
//! can leave the coordinator stuck in [`CoordinatorState::Executing`].
//!
//! Validation and busy errors go to the submitting subscriber only (or to
//! everyone when the submission has no origin). Answers, telemetry and
//! `ALGORITM_ERROR`s are broadcast.

mod command;
mod state;
mod telemetry;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub use state::{CoordinatorState, VoltageSnapshot, VoltageState};

use crate::config::CoordinatorConfig;
use crate::error::{AppResult, RackError};
use crate::hardware::HvBackend;
use crate::hub::{SubscriberId, Subscription, TelemetryHub};
use crate::messages::{RawCommand, Reply};
use crate::storage::MeasurementSink;
use crate::validation::validate;
use command::CommandContext;
use state::{ExecutionSlot, MeasuredWriter, TargetWriter};
use telemetry::TelemetryLoop;

/// A raw command plus the subscription that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Undecoded command.
    pub command: RawCommand,
    /// Subscription to route rejections to.
    pub origin: Option<SubscriberId>,
}

/// Cloneable front door used by transports.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    intake: mpsc::UnboundedSender<Submission>,
    hub: TelemetryHub,
    voltage: Arc<VoltageState>,
    slot: Arc<ExecutionSlot>,
}

impl CoordinatorHandle {
    /// Queues a command. Fails only once the coordinator has stopped.
    pub fn submit(&self, command: RawCommand, origin: Option<SubscriberId>) -> AppResult<()> {
        self.intake
            .send(Submission { command, origin })
            .map_err(|_| RackError::Cancelled)
    }

    /// Registers a new reply subscription.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Sends a reply to one subscriber only.
    pub fn reply_to(&self, id: SubscriberId, reply: Reply) -> bool {
        self.hub.send_to(id, reply)
    }

    /// Current voltages.
    pub fn voltage(&self) -> VoltageSnapshot {
        self.voltage.snapshot()
    }

    /// Whether a command is executing.
    pub fn state(&self) -> CoordinatorState {
        self.slot.state()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopped,
}

/// Resources handed to the tasks on start.
struct Pending {
    intake: mpsc::UnboundedReceiver<Submission>,
    measured: MeasuredWriter,
    target: TargetWriter,
    sink: Option<Box<dyn MeasurementSink>>,
}

/// The command/telemetry coordinator. See the module docs.
pub struct Coordinator {
    config: CoordinatorConfig,
    backend: Arc<dyn HvBackend>,
    hub: TelemetryHub,
    handle: CoordinatorHandle,
    voltage: Arc<VoltageState>,
    slot: Arc<ExecutionSlot>,
    pending: Mutex<Option<Pending>>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    backend_initialized: AtomicBool,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Creates a stopped coordinator. Commands submitted before [`start`](Self::start)
    /// are queued and handled once it runs.
    pub fn new(
        config: CoordinatorConfig,
        backend: Arc<dyn HvBackend>,
        hub: TelemetryHub,
        sink: Option<Box<dyn MeasurementSink>>,
    ) -> Self {
        let (voltage, measured, target) = VoltageState::split(0.0);
        let slot = Arc::new(ExecutionSlot::default());
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();

        let handle = CoordinatorHandle {
            intake: intake_tx,
            hub: hub.clone(),
            voltage: Arc::clone(&voltage),
            slot: Arc::clone(&slot),
        };

        Self {
            config,
            backend,
            hub,
            handle,
            voltage,
            slot,
            pending: Mutex::new(Some(Pending {
                intake: intake_rx,
                measured,
                target,
                sink,
            })),
            lifecycle: Mutex::new(Lifecycle::Created),
            tasks: Mutex::new(Vec::new()),
            backend_initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Handle for transports.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// The reply hub.
    pub fn hub(&self) -> &TelemetryHub {
        &self.hub
    }

    /// Current voltages.
    pub fn voltage(&self) -> VoltageSnapshot {
        self.voltage.snapshot()
    }

    /// Whether a command is executing.
    pub fn state(&self) -> CoordinatorState {
        self.slot.state()
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Running
    }

    /// Initializes the backend, then spawns the intake and telemetry loops.
    ///
    /// Backend initialization failure is returned and nothing is spawned.
    /// Calling `start` twice fails with [`RackError::AlreadyStarted`]; starting
    /// after [`stop`](Self::stop) fails with [`RackError::Cancelled`].
    pub async fn start(&self) -> AppResult<()> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running => return Err(RackError::AlreadyStarted),
                Lifecycle::Stopped => return Err(RackError::Cancelled),
            }
        }

        info!(backend = %self.backend.describe(), "Initializing backend");
        let initialized = tokio::select! {
            _ = self.cancel.cancelled() => Err(RackError::Cancelled),
            result = self.backend.initialize() => result,
        };
        if let Err(e) = initialized {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Starting {
                *lifecycle = Lifecycle::Created;
            }
            return Err(e);
        }
        self.backend_initialized.store(true, Ordering::SeqCst);

        let spawned = {
            let mut tasks = lock(&self.tasks);
            if self.cancel.is_cancelled() {
                false
            } else {
                let Some(pending) = lock(&self.pending).take() else {
                    return Err(RackError::AlreadyStarted);
                };
                tasks.extend(self.spawn_loops(pending));
                true
            }
        };

        if !spawned {
            // stop() ran while the backend was initializing.
            self.shutdown_backend().await;
            return Err(RackError::Cancelled);
        }

        let mut lifecycle = lock(&self.lifecycle);
        if *lifecycle == Lifecycle::Starting {
            *lifecycle = Lifecycle::Running;
        }
        info!("Coordinator started");
        Ok(())
    }

    fn spawn_loops(&self, pending: Pending) -> [JoinHandle<()>; 2] {
        let telemetry = TelemetryLoop {
            backend: Arc::clone(&self.backend),
            measured: pending.measured,
            hub: self.hub.clone(),
            sink: pending.sink,
            error_backoff: self.config.telemetry_error_backoff(),
        };
        let intake = IntakeLoop {
            intake: pending.intake,
            slot: Arc::clone(&self.slot),
            ctx: CommandContext {
                backend: Arc::clone(&self.backend),
                voltage: Arc::clone(&self.voltage),
                target: Arc::new(pending.target),
                hub: self.hub.clone(),
                poll: self.config.convergence_poll(),
            },
        };

        [
            tokio::spawn(
                telemetry
                    .run(self.cancel.child_token())
                    .instrument(tracing::info_span!("telemetry")),
            ),
            tokio::spawn(
                intake
                    .run(self.cancel.child_token())
                    .instrument(tracing::info_span!("intake")),
            ),
        ]
    }

    /// Cancels both loops and any in-flight command, waits for them, then shuts
    /// the backend down. Safe to call any number of times, before or after
    /// `start`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        *lock(&self.lifecycle) = Lifecycle::Stopped;

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
        self.shutdown_backend().await;
    }

    async fn shutdown_backend(&self) {
        if self.backend_initialized.swap(false, Ordering::SeqCst) {
            match self.backend.shutdown().await {
                Ok(()) => info!("Backend shut down"),
                Err(e) => warn!(error = %e, "Backend shutdown failed"),
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("backend", &self.backend.describe())
            .field("lifecycle", &*lock(&self.lifecycle))
            .field("state", &self.state())
            .field("voltage", &self.voltage())
            .finish()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Tasks hold their own Arcs; make sure they do not outlive the owner.
        self.cancel.cancel();
    }
}

struct IntakeLoop {
    intake: mpsc::UnboundedReceiver<Submission>,
    slot: Arc<ExecutionSlot>,
    ctx: CommandContext,
}

impl IntakeLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut current: Option<JoinHandle<()>> = None;
        loop {
            let submission = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.intake.recv() => match next {
                    Some(submission) => submission,
                    None => break,
                },
            };
            if let Some(task) = self.accept(submission, &cancel) {
                current = Some(task);
            }
        }

        if let Some(task) = current {
            let _ = task.await;
        }
        debug!("Intake loop stopped");
    }

    fn accept(&self, submission: Submission, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
        let accepted_at = Instant::now();
        let Submission { command, origin } = submission;

        let command = match validate(&command) {
            Ok(command) => command,
            Err(e) => {
                debug!(kind = %command.kind, error = %e, "Command rejected");
                self.reply(origin, Reply::invalid(&e));
                return None;
            }
        };

        let Some(guard) = self.slot.try_acquire() else {
            debug!(kind = %command.kind(), "Command rejected: busy");
            self.reply(origin, Reply::busy());
            return None;
        };

        info!(kind = %command.kind(), voltage = command.voltage(), "Command accepted");
        let span = tracing::info_span!("command", kind = %command.kind());
        Some(tokio::spawn(
            command::run(
                self.ctx.clone(),
                command,
                accepted_at,
                guard,
                cancel.child_token(),
            )
            .instrument(span),
        ))
    }

    fn reply(&self, origin: Option<SubscriberId>, reply: Reply) {
        match origin {
            Some(id) => {
                if !self.ctx.hub.send_to(id, reply) {
                    debug!(subscriber = %id, "Origin gone, rejection dropped");
                }
            }
            None => self.ctx.hub.publish(reply),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Best-effort text of a caught panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
