//! File backups for the in-memory store
//!
//! The backup file holds one JSON record per line and is rewritten in full on
//! every flush. [`BackupCoordinator`] decides when to flush:
//!
//! - periodic: every `store_interval`, whether or not anything changed;
//! - continuous (`store_interval == 0`): as soon as a writer signals new data.
//!
//! Writers signal through a `Notify` that holds at most one permit, so a write
//! that lands while a flush is running is picked up by the next flush.

use super::memory::StoreState;
use crate::metrics;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_shared::Metric;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup I/O: {0}")]
    Io(#[from] io::Error),

    #[error("malformed backup record on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode backup record: {0}")]
    Encode(#[source] serde_json::Error),
}

impl BackupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// When the coordinator flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSchedule {
    Periodic(Duration),
    Continuous,
}

impl BackupSchedule {
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::Continuous
        } else {
            Self::Periodic(interval)
        }
    }
}

/// A newline-delimited JSON backup file.
#[derive(Debug, Clone)]
pub struct BackupFile {
    path: PathBuf,
}

impl BackupFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record in file order. Blank lines are skipped; any malformed
    /// line fails the whole load.
    pub async fn load(&self) -> Result<Vec<Metric>, BackupError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut metrics = Vec::new();
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let metric = serde_json::from_str(&line).map_err(|source| BackupError::Decode {
                line: line_no,
                source,
            })?;
            metrics.push(metric);
        }

        Ok(metrics)
    }

    /// Replace the file's content with `snapshot`.
    ///
    /// Records go to a sibling temp file which is synced and then renamed over
    /// the target, so the target always holds one complete snapshot.
    pub async fn save(&self, snapshot: &[Metric]) -> Result<(), BackupError> {
        let tmp = self.temp_path();
        if let Err(e) = Self::write_records(&tmp, snapshot).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Open (creating if needed) the target for writing, without touching
    /// its content.
    pub async fn ensure_writable(&self) -> Result<(), BackupError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        Ok(())
    }

    async fn write_records(path: &Path, snapshot: &[Metric]) -> Result<(), BackupError> {
        let file = File::create(path).await?;
        let mut writer = BufWriter::new(file);
        for metric in snapshot {
            let mut line = serde_json::to_vec(metric).map_err(BackupError::Encode)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "backup".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Flushes the store's content to its backup file.
pub struct BackupCoordinator {
    file: BackupFile,
    schedule: BackupSchedule,
    state: Arc<StoreState>,
    /// Held for the duration of a flush, so snapshots reach the file in the
    /// order they were taken.
    flushing: AsyncMutex<()>,
}

impl BackupCoordinator {
    pub(crate) fn new(file: BackupFile, schedule: BackupSchedule, state: Arc<StoreState>) -> Self {
        Self {
            file,
            schedule,
            state,
            flushing: AsyncMutex::new(()),
        }
    }

    /// Main loop. On cancellation performs one final flush, without waiting
    /// for a write signal, then returns.
    pub async fn run(&self, cancel: CancellationToken) {
        debug!(
            "Backup service started ({:?}, {})",
            self.schedule,
            self.file.path().display()
        );

        match self.schedule {
            BackupSchedule::Periodic(period) => {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => self.scheduled_flush("Periodic backup").await,
                    }
                }
            }
            BackupSchedule::Continuous => loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = self.state.written.notified() => self.scheduled_flush("Continuous backup").await,
                }
            },
        }

        if let Err(e) = self.flush().await {
            error!("Shutdown backup to {} failed: {}", self.file.path().display(), e);
        }
        debug!("Backup service stopped");
    }

    /// Flush now, waiting for any in-flight flush first. Returns the number
    /// of records written.
    pub async fn flush(&self) -> Result<usize, BackupError> {
        let _guard = self.flushing.lock().await;
        self.write_snapshot("Backup flush").await
    }

    /// A signal or tick that arrives during another flush still gets its own
    /// snapshot once that flush finishes.
    async fn scheduled_flush(&self, label: &str) {
        let _guard = self.flushing.lock().await;
        if let Err(e) = self.write_snapshot(label).await {
            error!("{} to {} failed: {}", label, self.file.path().display(), e);
        }
    }

    async fn write_snapshot(&self, label: &str) -> Result<usize, BackupError> {
        let snapshot = self.state.snapshot();
        let count = snapshot.len();
        let start = Instant::now();

        match self.file.save(&snapshot).await {
            Ok(()) => {
                metrics::BACKUP_FLUSH_TOTAL.with_label_values(&["ok"]).inc();
                metrics::BACKUP_FLUSH_DURATION.observe(start.elapsed().as_secs_f64());
                metrics::BACKUP_RECORDS.set(count as f64);
                debug!("{}: {} records to {}", label, count, self.file.path().display());
                Ok(count)
            }
            Err(e) => {
                metrics::BACKUP_FLUSH_TOTAL.with_label_values(&["error"]).inc();
                Err(e)
            }
        }
    }
}

/// Restore helper used at startup: a missing or corrupt file yields an empty
/// store rather than an error.
pub(crate) async fn restore(file: &BackupFile) -> Vec<Metric> {
    match file.load().await {
        Ok(metrics) => {
            info!(
                "Restored {} records from {}",
                metrics.len(),
                file.path().display()
            );
            metrics
        }
        Err(e) if e.is_not_found() => {
            info!("No backup at {}, starting empty", file.path().display());
            Vec::new()
        }
        Err(e) => {
            error!(
                "Error reading backup {}: {}. Skipping restore",
                file.path().display(),
                e
            );
            Vec::new()
        }
    }
}
