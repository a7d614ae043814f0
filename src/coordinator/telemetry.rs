//! Telemetry loop: read, record, persist, publish. Never exits on errors.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::panic_message;
use super::state::MeasuredWriter;
use crate::error::AppResult;
use crate::hardware::HvBackend;
use crate::hub::TelemetryHub;
use crate::messages::Reply;
use crate::storage::MeasurementSink;

pub(crate) struct TelemetryLoop {
    pub(crate) backend: Arc<dyn HvBackend>,
    pub(crate) measured: MeasuredWriter,
    pub(crate) hub: TelemetryHub,
    pub(crate) sink: Option<Box<dyn MeasurementSink>>,
    pub(crate) error_backoff: Duration,
}

impl TelemetryLoop {
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        debug!("Telemetry loop started");
        loop {
            let tick = AssertUnwindSafe(self.tick()).catch_unwind();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = tick => outcome,
            };

            let description = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "Telemetry read failed");
                    e.to_string()
                }
                Err(panic) => {
                    let description = panic_message(panic.as_ref());
                    error!(panic = %description, "Telemetry read panicked");
                    description
                }
            };
            self.hub.publish(Reply::algorithm_error(description));

            // A dead link must not spin.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.error_backoff) => {}
            }
        }
        debug!("Telemetry loop stopped");
    }

    async fn tick(&mut self) -> AppResult<()> {
        let voltage = self.backend.read_measured_voltage().await?;
        self.measured.set(voltage);
        debug!(voltage, "Measured voltage");

        if let Some(sink) = self.sink.as_mut() {
            let rounded = (voltage * 100.0).round() / 100.0;
            if let Err(e) = sink.write(rounded).await {
                warn!(error = %e, "Failed to persist measurement");
                self.hub
                    .publish(Reply::algorithm_error(format!("failed to persist measurement: {e}")));
            }
        }

        self.hub.publish(Reply::telemetry(voltage));
        Ok(())
    }
}
