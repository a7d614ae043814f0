use std::time::Duration;
use tokio::process::Command;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::error::{AppResult, RackError};

/// Periodically runs a shell command that synchronises the local database.
///
/// The command runs every `interval` and once more when the loop is cancelled.
/// Failures are logged and never stop the loop.
#[derive(Debug, Clone)]
pub struct SyncLoop {
    command: String,
    interval: Duration,
}

impl SyncLoop {
    /// Creates a loop for `command`, run through `sh -c`.
    pub fn new(command: impl Into<String>, interval: Duration) -> Self {
        Self {
            command: command.into(),
            interval,
        }
    }

    /// Builds the loop from storage settings, if a sync command is configured.
    pub fn from_config(config: &StorageConfig) -> Option<Self> {
        config
            .sync_command
            .as_ref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| Self::new(c.clone(), Duration::from_secs(config.sync_interval_secs)))
    }

    /// Runs the command once and waits for it.
    pub async fn run_once(&self) -> AppResult<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            info!(command = %self.command, "Database sync finished");
            Ok(())
        } else {
            Err(RackError::Io(std::io::Error::other(format!(
                "sync command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))))
        }
    }

    /// Runs until `cancel` fires, then syncs one last time.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Database sync failed");
                    }
                }
            }
        }

        if let Err(e) = self.run_once().await {
            warn!(error = %e, "Final database sync failed");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_once_reports_failure() {
        let ok = SyncLoop::new("true", Duration::from_secs(60));
        ok.run_once().await.unwrap();

        let bad = SyncLoop::new("echo nope >&2; exit 3", Duration::from_secs(60));
        let err = bad.run_once().await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_runs_periodically_and_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("syncs");
        let command = format!("echo x >> {}", marker.display());
        let sync = SyncLoop::new(command, Duration::from_millis(100));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sync.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        task.await.unwrap();

        let runs = std::fs::read_to_string(&marker).unwrap().lines().count();
        // At least two periodic runs plus the final one.
        assert!(runs >= 3, "expected >= 3 runs, got {runs}");
    }

    #[test]
    fn test_from_config_requires_command() {
        let mut config = StorageConfig::default();
        assert!(SyncLoop::from_config(&config).is_none());
        config.sync_command = Some("  ".into());
        assert!(SyncLoop::from_config(&config).is_none());
        config.sync_command = Some("rsync -a db/ remote:db/".into());
        assert!(SyncLoop::from_config(&config).is_some());
    }
}
