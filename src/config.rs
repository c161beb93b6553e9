//! Top-level configuration
//!
//! Aggregates the per-component configs. Every field has a default, and
//! `from_env` overrides them from `DOCK_SYNC_*` variables:
//!
//! - DOCK_SYNC_URL: realtime endpoint (default `ws://127.0.0.1:8080/ws`)
//! - DOCK_SYNC_BASE_DELAY_MS: first reconnect delay (default 1000)
//! - DOCK_SYNC_MAX_DELAY_MS: reconnect delay cap (default 30000)
//! - DOCK_SYNC_MAX_ATTEMPTS: reconnect attempts before giving up (default 5)
//! - DOCK_SYNC_HEARTBEAT_SECS: ping interval (default 30)
//! - DOCK_SYNC_BATCH_SIZE: messages per normal batch (default 10)
//! - DOCK_SYNC_DATA_DIR: offline queue directory (default: in-memory only)
//! - DOCK_SYNC_COMPRESSION_THRESHOLD: bytes above which payloads are gzipped (default 1024)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cache::DashboardConfig;
use crate::offline::OfflineConfig;
use crate::protocol::CodecConfig;
use crate::realtime::{BatcherConfig, ConnectionConfig};
use crate::types::{Result, SyncError};

pub const ENV_URL: &str = "DOCK_SYNC_URL";
pub const ENV_BASE_DELAY_MS: &str = "DOCK_SYNC_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "DOCK_SYNC_MAX_DELAY_MS";
pub const ENV_MAX_ATTEMPTS: &str = "DOCK_SYNC_MAX_ATTEMPTS";
pub const ENV_HEARTBEAT_SECS: &str = "DOCK_SYNC_HEARTBEAT_SECS";
pub const ENV_BATCH_SIZE: &str = "DOCK_SYNC_BATCH_SIZE";
pub const ENV_DATA_DIR: &str = "DOCK_SYNC_DATA_DIR";
pub const ENV_COMPRESSION_THRESHOLD: &str = "DOCK_SYNC_COMPRESSION_THRESHOLD";

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub batcher: BatcherConfig,
    pub codec: CodecConfig,
    pub dashboard: DashboardConfig,
    pub offline: OfflineConfig,
    /// Directory for the persisted offline queue. `None` keeps it in memory.
    pub data_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::with_url(url),
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Defaults overridden by `DOCK_SYNC_*` environment variables.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_URL).filter(|url| !url.trim().is_empty()) {
            config.connection.url = url.trim().to_string();
        }
        if let Some(ms) = parse(&lookup, ENV_BASE_DELAY_MS) {
            config.connection.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, ENV_MAX_DELAY_MS) {
            config.connection.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse(&lookup, ENV_MAX_ATTEMPTS) {
            config.connection.max_attempts = attempts;
        }
        if let Some(secs) = parse(&lookup, ENV_HEARTBEAT_SECS) {
            config.connection.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse(&lookup, ENV_BATCH_SIZE) {
            config.batcher = config.batcher.with_batch_size(size);
        }
        if let Some(threshold) = parse(&lookup, ENV_COMPRESSION_THRESHOLD) {
            config.codec.compression_threshold = threshold;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|dir| !dir.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir.trim()));
        }

        config
    }

    /// Reject combinations the components cannot run with
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if connection.url.is_empty() {
            return Err(SyncError::Config("connection url is empty".to_string()));
        }
        if connection.base_delay.is_zero() {
            return Err(SyncError::Config("base reconnect delay must be positive".to_string()));
        }
        if connection.max_delay < connection.base_delay {
            return Err(SyncError::Config(format!(
                "max reconnect delay ({} ms) is below the base delay ({} ms)",
                connection.max_delay.as_millis(),
                connection.base_delay.as_millis()
            )));
        }
        if connection.heartbeat_interval.is_zero() {
            return Err(SyncError::Config("heartbeat interval must be positive".to_string()));
        }
        if self.batcher.batch_size > self.batcher.max_queue_size {
            return Err(SyncError::Config(format!(
                "batch size {} exceeds max queue size {}",
                self.batcher.batch_size, self.batcher.max_queue_size
            )));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
