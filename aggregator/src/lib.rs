//! Aggregator service library
//!
//! Metric storage behind a single [`storage::MetricStore`] contract: an
//! in-memory map with file backups, or a SQLite table with transactional
//! upserts.

pub mod config;
pub mod metrics;
pub mod server;
pub mod storage;

pub use config::AggregatorConfig;
pub use storage::{MetricStore, StoreError};
