//! In-memory metric store with optional file backups

use super::backup::{self, BackupCoordinator, BackupFile, BackupSchedule};
use super::{MetricStore, StoreError};
use crate::metrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tally_shared::aggregate;
use tally_shared::{Metric, MetricKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
pub struct MemorySettings {
    /// Time between backups; zero flushes after every write.
    pub store_interval: Duration,
    /// Backup file. `None` keeps metrics in memory only.
    pub file_storage_path: Option<PathBuf>,
    /// Replay the backup file at startup.
    pub restore: bool,
}

/// The map and the write signal, shared with the backup coordinator.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    metrics: Mutex<HashMap<String, Metric>>,
    /// Raised after every write that changed the map.
    pub(crate) written: Notify,
}

impl StoreState {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Metric>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> Vec<Metric> {
        self.lock().values().cloned().collect()
    }
}

/// Metric store kept in process memory. Thread-safe.
pub struct MemoryStore {
    state: Arc<StoreState>,
    pub(super) backup: Option<BackupCoordinator>,
}

impl MemoryStore {
    /// A store without backups.
    pub fn new() -> Self {
        Self {
            state: Arc::new(StoreState::default()),
            backup: None,
        }
    }

    /// Create the store, replaying the backup file when `restore` is set.
    ///
    /// A missing or corrupt backup only logs and leaves the store empty. An
    /// unwritable backup path is an error.
    pub async fn open(settings: MemorySettings) -> Result<Self, StoreError> {
        let state = Arc::new(StoreState::default());

        let backup = match settings.file_storage_path {
            Some(path) => {
                let file = BackupFile::new(path);
                if settings.restore {
                    let restored = backup::restore(&file).await;
                    let len = {
                        let mut map = state.lock();
                        for metric in restored {
                            map.insert(metric.id.clone(), metric);
                        }
                        map.len()
                    };
                    metrics::STORE_METRICS.set(len as f64);
                }
                file.ensure_writable().await?;
                let schedule = BackupSchedule::from_interval(settings.store_interval);
                Some(BackupCoordinator::new(file, schedule, state.clone()))
            }
            None => None,
        };

        Ok(Self { state, backup })
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current content to the backup file immediately.
    pub async fn flush(&self) -> Result<(), StoreError> {
        if let Some(backup) = &self.backup {
            backup.flush().await?;
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    /// Applies the whole batch in one critical section. The first merge error
    /// stops the batch; metrics applied before it are kept.
    async fn add_metrics(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>, StoreError> {
        let (outcome, len) = {
            let mut map = self.state.lock();
            let outcome = aggregate::apply_batch(&mut map, metrics);
            (outcome, map.len())
        };

        if !outcome.applied.is_empty() {
            self.state.written.notify_one();
        }
        metrics::STORE_METRICS.set(len as f64);

        let status = if outcome.error.is_some() { "error" } else { "ok" };
        metrics::STORE_WRITES_TOTAL
            .with_label_values(&[BACKEND, status])
            .inc();

        outcome.into_result().map_err(StoreError::from)
    }

    async fn get_metric(&self, kind: MetricKind, id: &str) -> Result<Metric, StoreError> {
        let map = self.state.lock();
        match map.get(id) {
            None => Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            }),
            Some(metric) if metric.kind() != kind => Err(StoreError::WrongType {
                id: id.to_string(),
                requested: kind,
            }),
            Some(metric) => Ok(metric.clone()),
        }
    }

    async fn read_all_metrics(&self) -> Result<Vec<Metric>, StoreError> {
        Ok(self.state.snapshot())
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        match &self.backup {
            Some(backup) => backup.run(cancel).await,
            None => cancel.cancelled().await,
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_counter_accumulates() {
        let store = MemoryStore::new();
        for delta in [1, 2, 3, 4] {
            store.add_metrics(vec![Metric::counter("c", delta)]).await.unwrap();
        }
        let metric = store.get_metric(MetricKind::Counter, "c").await.unwrap();
        assert_eq!(metric.delta(), Some(10));
    }

    #[tokio::test]
    async fn test_gauge_last_write_wins() {
        let store = MemoryStore::new();
        store.add_metrics(vec![Metric::gauge("Y", 10.0)]).await.unwrap();
        store.add_metrics(vec![Metric::gauge("Y", 20.0)]).await.unwrap();
        let metric = store.get_metric(MetricKind::Gauge, "Y").await.unwrap();
        assert_eq!(metric.reading(), Some(20.0));
    }

    #[tokio::test]
    async fn test_add_returns_merged_values() {
        let store = MemoryStore::new();
        store.add_metrics(vec![Metric::counter("X", 1)]).await.unwrap();
        let updated = store
            .add_metrics(vec![Metric::counter("X", 1), Metric::gauge("G", 0.5)])
            .await
            .unwrap();
        assert_eq!(updated, vec![Metric::counter("X", 2), Metric::gauge("G", 0.5)]);
    }

    #[tokio::test]
    async fn test_wrong_type_leaves_value_unchanged() {
        let store = MemoryStore::new();
        store.add_metrics(vec![Metric::counter("m", 5)]).await.unwrap();

        let err = store
            .add_metrics(vec![Metric::gauge("m", 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));

        let metric = store.get_metric(MetricKind::Counter, "m").await.unwrap();
        assert_eq!(metric.delta(), Some(5));
    }

    #[tokio::test]
    async fn test_batch_error_keeps_earlier_elements() {
        let store = MemoryStore::new();
        store.add_metrics(vec![Metric::gauge("g", 1.0)]).await.unwrap();

        let result = store
            .add_metrics(vec![
                Metric::counter("before", 1),
                Metric::counter("g", 1),
                Metric::counter("after", 1),
            ])
            .await;
        assert!(result.is_err());

        assert!(store.get_metric(MetricKind::Counter, "before").await.is_ok());
        assert!(matches!(
            store.get_metric(MetricKind::Counter, "after").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_metric_errors() {
        let store = MemoryStore::new();
        store.add_metrics(vec![Metric::gauge("g", 1.0)]).await.unwrap();

        assert!(matches!(
            store.get_metric(MetricKind::Gauge, "missing").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_metric(MetricKind::Counter, "g").await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_counters_lose_no_updates() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.add_metrics(vec![Metric::counter("hits", 1)]).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let metric = store.get_metric(MetricKind::Counter, "hits").await.unwrap();
        assert_eq!(metric.delta(), Some(800));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_skips_corrupt_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{\"id\":\"a\",\"type\":\"counter\",\"delta\":1}\n{broken\n").unwrap();

        let store = MemoryStore::open(MemorySettings {
            store_interval: Duration::from_secs(300),
            file_storage_path: Some(path),
            restore: true,
        })
        .await
        .unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_restore_last_duplicate_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(
            &path,
            "{\"id\":\"a\",\"type\":\"counter\",\"delta\":1}\n{\"id\":\"a\",\"type\":\"counter\",\"delta\":7}\n",
        )
        .unwrap();

        let store = MemoryStore::open(MemorySettings {
            store_interval: Duration::from_secs(300),
            file_storage_path: Some(path),
            restore: true,
        })
        .await
        .unwrap();

        let metric = store.get_metric(MetricKind::Counter, "a").await.unwrap();
        assert_eq!(metric.delta(), Some(7));
    }

    #[tokio::test]
    async fn test_restore_disabled_ignores_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{\"id\":\"a\",\"type\":\"counter\",\"delta\":1}\n").unwrap();

        let store = MemoryStore::open(MemorySettings {
            store_interval: Duration::from_secs(300),
            file_storage_path: Some(path),
            restore: false,
        })
        .await
        .unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_backup_path_is_an_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let result = MemoryStore::open(MemorySettings {
            store_interval: Duration::ZERO,
            file_storage_path: Some(blocker.join("metrics.json")),
            restore: false,
        })
        .await;

        assert!(matches!(result, Err(StoreError::Backup(_))));
    }
}
