//! SQLite storage backend
//!
//! Each call opens its own connection on a blocking worker and is bounded by a
//! per-operation timeout. A batch write is one transaction: the merge rule is
//! expressed in the upsert itself, and any failing element rolls the whole
//! batch back. A write that times out is rolled back as well; the worker only
//! commits if the caller is still waiting for it.

use super::{MetricStore, StoreError};
use crate::metrics;
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_shared::aggregate;
use tally_shared::{Metric, MetricKind, MetricValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const BACKEND: &str = "sql";

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS metrics (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('counter', 'gauge')),
    value REAL,
    delta INTEGER,
    CHECK ((value IS NULL) <> (delta IS NULL))
)";

/// Insert, or merge into the existing row when the stored kind matches.
/// A kind mismatch updates nothing and returns no row.
const QUERY_UPSERT: &str = "\
INSERT INTO metrics (id, kind, value, delta) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT (id) DO UPDATE SET
    value = excluded.value,
    delta = CASE WHEN excluded.kind = 'counter' THEN metrics.delta + excluded.delta ELSE excluded.delta END
WHERE metrics.kind = excluded.kind
RETURNING value, delta";

const QUERY_GET: &str = "SELECT kind, value, delta FROM metrics WHERE id = ?1 LIMIT 1";

const QUERY_GET_ALL: &str = "SELECT id, kind, value, delta FROM metrics";

#[derive(Debug, Clone)]
pub struct SqlSettings {
    /// Database path or `file:` URI.
    pub url: String,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub ping_timeout: Duration,
}

impl SqlSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            write_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(1),
        }
    }
}

const RUNNING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a blocking call commits or the waiting
/// task gives up on it.
#[derive(Debug, Default)]
struct CallState(AtomicU8);

impl CallState {
    /// Called by the worker right before `COMMIT`. False once the caller has
    /// timed out; the worker must then roll back.
    fn begin_commit(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called by the waiting task on timeout. False if the worker is already
    /// committing, in which case its result must be awaited.
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// SQLite-backed metric store. Holds no connection between calls.
pub struct SqlStore {
    settings: SqlSettings,
}

impl SqlStore {
    /// A store for `settings` without touching the database.
    pub fn new(settings: SqlSettings) -> Self {
        Self { settings }
    }

    /// Check the database is reachable and create the schema if needed.
    pub async fn connect(settings: SqlSettings) -> Result<Self, StoreError> {
        let store = Self::new(settings);
        store.ping().await?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Idempotently create the `metrics` table and switch the database to WAL.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.run("ensure_schema", self.settings.write_timeout, |conn, _| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.execute(SCHEMA, [])?;
            Ok(())
        })
        .await?;
        debug!("Metrics table ready");
        Ok(())
    }

    /// Run `f` against a fresh connection on a blocking worker. If `timeout`
    /// elapses first the worker is abandoned and `Timeout` is returned, unless
    /// it has already started committing, in which case its result stands.
    async fn run<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &CallState) -> Result<T, StoreError> + Send + 'static,
    {
        let url = self.settings.url.clone();
        let start = Instant::now();
        let state = Arc::new(CallState::default());

        let mut task = tokio::task::spawn_blocking({
            let state = state.clone();
            move || {
                let mut conn = open_connection(&url, timeout).map_err(StoreError::Connection)?;
                f(&mut conn, &state)
            }
        });

        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined?,
            Err(_) if state.abandon() => Err(StoreError::Timeout { operation, timeout }),
            Err(_) => {
                debug!("{} passed its timeout while committing", operation);
                task.await?
            }
        };

        metrics::SQL_QUERY_DURATION
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
        result
    }
}

fn open_connection(url: &str, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(url)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Rebuild a metric from its stored columns.
fn decode(
    id: String,
    kind: &str,
    value: Option<f64>,
    delta: Option<i64>,
) -> Result<Metric, StoreError> {
    let kind: MetricKind = kind.parse().map_err(|e: tally_shared::ParseError| {
        StoreError::CorruptRow {
            id: id.clone(),
            reason: e.to_string(),
        }
    })?;
    let value = match (kind, value, delta) {
        (MetricKind::Counter, None, Some(delta)) => MetricValue::Counter(delta),
        (MetricKind::Gauge, Some(value), None) => MetricValue::Gauge(value),
        _ => {
            return Err(StoreError::CorruptRow {
                id,
                reason: format!("{} row must set exactly one of value/delta", kind),
            })
        }
    };
    Ok(Metric::new(id, value))
}

/// Upsert one metric inside `tx` and return the merged row.
fn upsert(tx: &rusqlite::Transaction<'_>, metric: &Metric) -> Result<Metric, StoreError> {
    aggregate::validate(metric)?;
    let row = tx
        .query_row(
            QUERY_UPSERT,
            params![metric.id, metric.kind().as_str(), metric.reading(), metric.delta()],
            |row| Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, Value>(1)?)),
        )
        .optional()
        .map_err(StoreError::Transaction)?;

    let Some((value, delta)) = row else {
        return Err(StoreError::WrongType {
            id: metric.id.clone(),
            requested: metric.kind(),
        });
    };

    let delta = match delta {
        Value::Null => None,
        Value::Integer(delta) => Some(delta),
        // SQLite promotes an overflowing integer sum to REAL.
        Value::Real(_) => {
            return Err(StoreError::Overflow {
                id: metric.id.clone(),
            })
        }
        other => {
            return Err(StoreError::CorruptRow {
                id: metric.id.clone(),
                reason: format!("unexpected delta column type {:?}", other.data_type()),
            })
        }
    };

    decode(metric.id.clone(), metric.kind().as_str(), value, delta)
}

#[async_trait]
impl MetricStore for SqlStore {
    /// One transaction per batch; any failure, including a timeout, rolls
    /// back every element.
    async fn add_metrics(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>, StoreError> {
        let timeout = self.settings.write_timeout;
        let result = self
            .run("add_metrics", timeout, move |conn, state| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(StoreError::Transaction)?;

                let mut updated = Vec::with_capacity(metrics.len());
                for metric in &metrics {
                    // Dropping `tx` on error rolls back.
                    updated.push(upsert(&tx, metric)?);
                }

                if !state.begin_commit() {
                    // Caller already reported a timeout; dropping `tx` rolls back.
                    return Err(StoreError::Timeout {
                        operation: "add_metrics",
                        timeout,
                    });
                }
                tx.commit().map_err(StoreError::Transaction)?;
                Ok(updated)
            })
            .await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::STORE_WRITES_TOTAL
            .with_label_values(&[BACKEND, status])
            .inc();
        result
    }

    async fn get_metric(&self, kind: MetricKind, id: &str) -> Result<Metric, StoreError> {
        let id = id.to_string();
        self.run("get_metric", self.settings.read_timeout, move |conn, _| {
            let row = conn
                .query_row(QUERY_GET, params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                })
                .optional()?;

            let Some((stored_kind, value, delta)) = row else {
                return Err(StoreError::NotFound { kind, id });
            };
            if stored_kind != kind.as_str() {
                return Err(StoreError::WrongType { id, requested: kind });
            }
            decode(id, &stored_kind, value, delta)
        })
        .await
    }

    async fn read_all_metrics(&self) -> Result<Vec<Metric>, StoreError> {
        self.run("read_all_metrics", self.settings.read_timeout, |conn, _| {
            let mut stmt = conn.prepare(QUERY_GET_ALL)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?;

            let mut metrics = Vec::new();
            for row in rows {
                let (id, kind, value, delta) = row?;
                metrics.push(decode(id, &kind, value, delta)?);
            }
            Ok(metrics)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run("ping", self.settings.ping_timeout, |conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(StoreError::Connection)?;
            Ok(())
        })
        .await
    }

    /// Ensures the schema, then idles until cancelled. Connections are
    /// per-call, so there is nothing to tear down.
    async fn start(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        cancel.cancelled().await;
        info!("SQL storage stopped");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
