//! Execution of one accepted command.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{ExecutionGuard, TargetWriter, VoltageState};
use super::panic_message;
use crate::error::AppResult;
use crate::hardware::HvBackend;
use crate::hub::TelemetryHub;
use crate::messages::{AnswerStatus, Command, Reply};

/// Everything a command task needs, cloned per command.
#[derive(Clone)]
pub(crate) struct CommandContext {
    pub(crate) backend: Arc<dyn HvBackend>,
    pub(crate) voltage: Arc<VoltageState>,
    pub(crate) target: Arc<TargetWriter>,
    pub(crate) hub: TelemetryHub,
    pub(crate) poll: Duration,
}

/// Runs `command` to completion and publishes its outcome.
///
/// `guard` is released before the reply goes out, so a client reacting to the
/// answer never sees a stale busy state. Cancellation publishes nothing.
pub(crate) async fn run(
    ctx: CommandContext,
    command: Command,
    accepted_at: Instant,
    guard: ExecutionGuard,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(kind = %command.kind(), "Command cancelled");
            return;
        }
        outcome = AssertUnwindSafe(execute(&ctx, &command, accepted_at)).catch_unwind() => outcome,
    };
    drop(guard);

    let reply = match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            warn!(kind = %command.kind(), error = %e, "Command failed");
            Reply::algorithm_error(e.to_string())
        }
        Err(panic) => {
            let description = panic_message(panic.as_ref());
            error!(kind = %command.kind(), panic = %description, "Command panicked");
            Reply::algorithm_error(description)
        }
    };
    ctx.hub.publish(reply);
}

async fn execute(ctx: &CommandContext, command: &Command, accepted_at: Instant) -> AppResult<Reply> {
    match *command {
        Command::SetVoltage { voltage } => {
            ctx.target.set(voltage);
            ctx.backend.apply_setpoint(voltage).await?;
            info!(voltage, "Setpoint applied");
            Ok(Reply::setpoint_applied())
        }
        Command::SetVoltageAndCheck {
            voltage,
            max_error,
            timeout,
        } => {
            ctx.target.set(voltage);
            ctx.backend.apply_setpoint(voltage).await?;
            debug!(voltage, max_error, ?timeout, "Setpoint applied, waiting for convergence");

            let convergence = converged(&ctx.voltage, voltage, max_error, ctx.poll);
            let waited = match accepted_at.checked_add(timeout) {
                Some(deadline) => timeout_at(deadline, convergence).await.ok(),
                // Past the clock's range: no deadline to enforce.
                None => Some(convergence.await),
            };
            let (status, measured) = match waited {
                Some(measured) => (AnswerStatus::Ok, measured),
                None => {
                    // One last look in case the deadline passed during the acknowledgement.
                    let measured = ctx.voltage.measured();
                    if (measured - voltage).abs() <= max_error {
                        (AnswerStatus::Ok, measured)
                    } else {
                        (AnswerStatus::Timeout, measured)
                    }
                }
            };

            info!(
                voltage,
                measured,
                status = status.as_str(),
                elapsed_ms = accepted_at.elapsed().as_millis() as u64,
                "Checked setpoint finished"
            );
            Ok(Reply::convergence(status, measured, voltage))
        }
    }
}

/// Resolves with the measured voltage once it is within `max_error` of `voltage`.
async fn converged(state: &VoltageState, voltage: f64, max_error: f64, poll: Duration) -> f64 {
    loop {
        let measured = state.measured();
        if (measured - voltage).abs() <= max_error {
            return measured;
        }
        sleep(poll).await;
    }
}
