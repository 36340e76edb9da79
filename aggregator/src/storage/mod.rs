//! Storage backends
//!
//! Both backends implement [`MetricStore`] and are observably equivalent for
//! the same write sequence, except that a failing batch is partially applied
//! in memory but fully rolled back in SQL.

pub mod backup;
pub mod memory;
pub mod sql;

use crate::config::AggregatorConfig;
use async_trait::async_trait;
use backup::BackupError;
use std::sync::Arc;
use std::time::Duration;
use tally_shared::{MergeError, Metric, MetricKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metric {kind} {id:?} not found")]
    NotFound { kind: MetricKind, id: String },

    #[error("metric {id:?} is stored with a type other than {requested}")]
    WrongType { id: String, requested: MetricKind },

    #[error("counter {id:?} would overflow")]
    Overflow { id: String },

    #[error("gauge {id:?} reading {value} is not finite")]
    NonFinite { id: String, value: f64 },

    #[error("backup: {0}")]
    Backup(#[from] BackupError),

    #[error("transaction rolled back: {0}")]
    Transaction(#[source] rusqlite::Error),

    #[error("database unreachable: {0}")]
    Connection(#[source] rusqlite::Error),

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt row for metric {id:?}: {reason}")]
    CorruptRow { id: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<MergeError> for StoreError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::WrongType { id, incoming, .. } => StoreError::WrongType {
                id,
                requested: incoming,
            },
            MergeError::Overflow { id } => StoreError::Overflow { id },
            MergeError::NonFinite { id, value } => StoreError::NonFinite { id, value },
        }
    }
}

/// The contract the API layer consumes.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Merge a batch into the store and return the post-merge value of each
    /// applied metric.
    async fn add_metrics(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>, StoreError>;

    async fn get_metric(&self, kind: MetricKind, id: &str) -> Result<Metric, StoreError>;

    /// Point-in-time snapshot, unordered.
    async fn read_all_metrics(&self) -> Result<Vec<Metric>, StoreError>;

    /// Liveness check for health endpoints.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Run the backend's background work until `cancel` fires. Returns after
    /// any shutdown flush has completed.
    async fn start(&self, cancel: CancellationToken) -> Result<(), StoreError>;

    fn backend(&self) -> &'static str;
}

/// Open the backend selected by `config`: SQL when a database URL is set,
/// in-memory with file backups otherwise.
pub async fn open(config: &AggregatorConfig) -> Result<Arc<dyn MetricStore>, StoreError> {
    match config.database_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            let store = sql::SqlStore::connect(config.sql_settings(url)).await?;
            tracing::info!("SQL storage enabled: {}", url);
            Ok(Arc::new(store))
        }
        None => {
            let store = memory::MemoryStore::open(config.memory_settings()).await?;
            tracing::info!(
                "In-memory storage enabled (backup: {:?})",
                config.backup_path()
            );
            Ok(Arc::new(store))
        }
    }
}
