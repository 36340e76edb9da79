//! Prometheus metrics for the aggregator service

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

// ── Store metrics ────────────────────────────────────────────────────────────

pub static STORE_WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_store_writes_total",
        "Batch writes received by the store",
        &["backend", "status"]
    )
    .unwrap()
});

pub static STORE_METRICS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tally_store_metrics",
        "Distinct metric ids held by the in-memory store"
    )
    .unwrap()
});

// ── Backup metrics ───────────────────────────────────────────────────────────

pub static BACKUP_FLUSH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_backup_flush_total",
        "Backup file flush attempts",
        &["status"]
    )
    .unwrap()
});

pub static BACKUP_FLUSH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "tally_backup_flush_duration_seconds",
        "Backup flush latency",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap()
});

pub static BACKUP_RECORDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tally_backup_records",
        "Records written by the last successful backup flush"
    )
    .unwrap()
});

// ── SQL metrics ──────────────────────────────────────────────────────────────

pub static SQL_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tally_sql_query_duration_seconds",
        "SQL store call latency",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
