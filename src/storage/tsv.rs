use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::MeasurementSink;
use crate::error::{AppResult, RackError};

const PARTITION_FORMAT: &str = "%y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.6f";

/// Date-partitioned TSV log under `<root>/<control_name>/<YY-MM-DD>.tsv`.
///
/// A partition starts with a `Timestamp\t<control_name>` header. Existing
/// partitions are appended to. Every row is flushed as soon as it is written.
///
/// As a [`MeasurementSink`] the file I/O runs on Tokio's blocking pool, so a
/// slow disk never stalls the runtime thread.
pub struct DailyTsvWriter {
    dir: PathBuf,
    partitions: Arc<Mutex<Partitions>>,
}

struct Partitions {
    dir: PathBuf,
    control_name: String,
    day: Option<NaiveDate>,
    writer: Option<csv::Writer<File>>,
}

impl DailyTsvWriter {
    /// Creates the control directory. No partition is opened until the first write.
    pub fn new<P: AsRef<Path>>(root: P, control_name: &str) -> AppResult<Self> {
        let dir = root.as_ref().join(control_name);
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "TSV measurement log ready");
        Ok(Self {
            dir: dir.clone(),
            partitions: Arc::new(Mutex::new(Partitions {
                dir,
                control_name: control_name.to_string(),
                day: None,
                writer: None,
            })),
        })
    }

    /// Path of the partition for `day`.
    pub fn partition_path(&self, day: NaiveDate) -> PathBuf {
        partition_path(&self.dir, day)
    }

    /// Appends `value` stamped with `at`, rolling to a new partition when the
    /// date changed since the previous row. Blocks on file I/O.
    pub fn write_at(&mut self, value: f64, at: NaiveDateTime) -> AppResult<()> {
        lock(&self.partitions).write_at(value, at)
    }
}

impl Partitions {
    fn write_at(&mut self, value: f64, at: NaiveDateTime) -> AppResult<()> {
        let day = at.date();
        if self.day != Some(day) || self.writer.is_none() {
            self.open_partition(day)?;
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write_record([
                at.format(TIME_FORMAT).to_string(),
                format!("{value:.2}"),
            ])?;
            writer.flush()?;
        }
        Ok(())
    }

    fn open_partition(&mut self, day: NaiveDate) -> AppResult<()> {
        if let Some(mut previous) = self.writer.take() {
            previous.flush()?;
        }

        let path = partition_path(&self.dir, day);
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(["Timestamp", self.control_name.as_str()])?;
            writer.flush()?;
        }

        debug!(path = %path.display(), is_new, "Opened TSV partition");
        self.day = Some(day);
        self.writer = Some(writer);
        Ok(())
    }
}

fn partition_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(format!("{}.tsv", day.format(PARTITION_FORMAT)))
}

fn lock(partitions: &Mutex<Partitions>) -> MutexGuard<'_, Partitions> {
    partitions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for DailyTsvWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyTsvWriter")
            .field("dir", &self.dir)
            .field("day", &lock(&self.partitions).day)
            .finish()
    }
}

#[async_trait]
impl MeasurementSink for DailyTsvWriter {
    async fn write(&mut self, value: f64) -> AppResult<()> {
        let at = Local::now().naive_local();
        let partitions = Arc::clone(&self.partitions);
        tokio::task::spawn_blocking(move || lock(&partitions).write_at(value, at))
            .await
            .map_err(|e| RackError::Io(std::io::Error::other(e)))?
    }
}
