//! Measurement persistence.
//!
//! The telemetry loop only depends on [`MeasurementSink`]. The production sink
//! is [`DailyTsvWriter`], a date-partitioned TSV log. [`SyncLoop`] periodically
//! runs an external command that ships the local database elsewhere.

mod sync;
mod tsv;

use async_trait::async_trait;

use crate::error::AppResult;

pub use sync::SyncLoop;
pub use tsv::DailyTsvWriter;

/// Append-only sink for telemetry values.
#[async_trait]
pub trait MeasurementSink: Send {
    /// Appends `value` with the current timestamp.
    async fn write(&mut self, value: f64) -> AppResult<()>;
}
