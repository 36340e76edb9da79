//! Aggregator configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! config file, then `TALLY_*` environment variables.

use crate::storage::memory::MemorySettings;
use crate::storage::sql::SqlSettings;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Admin HTTP listen address (health checks + metrics)
    pub admin_addr: String,

    /// Seconds between backups; 0 writes after every update
    pub store_interval: u64,

    /// Backup file path; empty disables backups
    pub file_storage_path: String,

    /// Replay the backup file at startup
    pub restore: bool,

    /// SQLite database path. When set, replaces the in-memory store.
    pub database_url: Option<String>,

    pub sql_write_timeout_ms: u64,
    pub sql_read_timeout_ms: u64,
    pub sql_ping_timeout_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            admin_addr: "127.0.0.1:9090".to_string(),
            store_interval: 300,
            file_storage_path: "/tmp/metrics-db.json".to_string(),
            restore: true,
            database_url: None,
            sql_write_timeout_ms: 3_000,
            sql_read_timeout_ms: 1_000,
            sql_ping_timeout_ms: 1_000,
        }
    }
}

impl AggregatorConfig {
    /// Load defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("TALLY").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }

    pub fn backup_path(&self) -> Option<PathBuf> {
        let path = self.file_storage_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }

    pub fn memory_settings(&self) -> MemorySettings {
        MemorySettings {
            store_interval: self.store_interval(),
            file_storage_path: self.backup_path(),
            restore: self.restore,
        }
    }

    pub fn sql_settings(&self, url: &str) -> SqlSettings {
        SqlSettings {
            url: url.to_string(),
            write_timeout: Duration::from_millis(self.sql_write_timeout_ms),
            read_timeout: Duration::from_millis(self.sql_read_timeout_ms),
            ping_timeout: Duration::from_millis(self.sql_ping_timeout_ms),
        }
    }
}
