//! Configuration for the record engine.
//!
//! # Example
//!
//! ```
//! use loom_store::EngineConfig;
//!
//! // Minimal config (uses defaults, in-memory backend)
//! let config = EngineConfig::default();
//! assert_eq!(config.queue_capacity, 10_000);
//!
//! // Durable config
//! let config = EngineConfig {
//!     sql_url: Some("sqlite:///var/lib/loom/records.db?mode=rwc".into()),
//!     evaluator_interval_secs: 60,
//!     ..Default::default()
//! };
//! assert!(config.sql_url.is_some());
//! ```
//!
//! # Environment overrides
//!
//! [`EngineConfig::from_env`] starts from the defaults and applies any
//! `LOOM_*` variable that is set, e.g. `LOOM_SQL_URL`,
//! `LOOM_EVALUATOR_INTERVAL_SECS`, `LOOM_QUEUE_CAPACITY`.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the record engine.
///
/// All fields have sensible defaults. Without `sql_url` the engine keeps
/// everything in memory.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// SQL connection string (e.g., "sqlite://loom.db?mode=rwc")
    #[serde(default)]
    pub sql_url: Option<String>,

    /// Seconds between retention passes (default: 5 min)
    #[serde(default = "default_evaluator_interval_secs")]
    pub evaluator_interval_secs: u64,

    /// Downsampling bucket width in seconds (default: 1 hour)
    #[serde(default = "default_downsample_window_secs")]
    pub downsample_window_secs: u64,

    /// Max queued records per device pair before the lowest tier is shed
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Idle sleep of a sync worker with nothing due
    #[serde(default = "default_sync_poll_interval_ms")]
    pub sync_poll_interval_ms: u64,

    /// Byte cap for one sync unit pulled by a worker
    #[serde(default = "default_sync_max_bytes")]
    pub sync_max_bytes: usize,

    /// First retry delay after a failed delivery
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling for tables without `max_delay_seconds`
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Batch size for tables without a sync priority config
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Retry count for tables without a sync priority config
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,

    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// Buffered operator alerts per subscriber
    #[serde(default = "default_alert_channel_capacity")]
    pub alert_channel_capacity: usize,
}

fn default_evaluator_interval_secs() -> u64 { 300 }
fn default_downsample_window_secs() -> u64 { 3600 }
fn default_queue_capacity() -> usize { 10_000 }
fn default_sync_poll_interval_ms() -> u64 { 500 }
fn default_sync_max_bytes() -> usize { 1024 * 1024 } // 1 MB
fn default_retry_base_delay_ms() -> u64 { 1000 }
fn default_max_backoff_secs() -> u64 { 300 }
fn default_batch_size() -> usize { 1000 }
fn default_retry_count() -> u32 { 3 }
fn default_zstd_level() -> i32 { 3 }
fn default_alert_channel_capacity() -> usize { 64 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sql_url: None,
            evaluator_interval_secs: default_evaluator_interval_secs(),
            downsample_window_secs: default_downsample_window_secs(),
            queue_capacity: default_queue_capacity(),
            sync_poll_interval_ms: default_sync_poll_interval_ms(),
            sync_max_bytes: default_sync_max_bytes(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            default_batch_size: default_batch_size(),
            default_retry_count: default_retry_count(),
            zstd_level: default_zstd_level(),
            alert_channel_capacity: default_alert_channel_capacity(),
        }
    }
}

/// A `LOOM_*` variable was set but could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct EnvConfigError {
    pub var: &'static str,
    pub value: String,
}

impl EngineConfig {
    /// Defaults overridden by `LOOM_*` environment variables.
    pub fn from_env() -> Result<Self, EnvConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnvConfigError> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            target: &mut T,
        ) -> Result<(), EnvConfigError> {
            if let Some(value) = lookup(var) {
                *target = value
                    .trim()
                    .parse()
                    .map_err(|_| EnvConfigError { var, value })?;
            }
            Ok(())
        }

        let mut c = Self::default();
        if let Some(url) = lookup("LOOM_SQL_URL").filter(|u| !u.is_empty()) {
            c.sql_url = Some(url);
        }
        parse(&lookup, "LOOM_EVALUATOR_INTERVAL_SECS", &mut c.evaluator_interval_secs)?;
        parse(&lookup, "LOOM_DOWNSAMPLE_WINDOW_SECS", &mut c.downsample_window_secs)?;
        parse(&lookup, "LOOM_QUEUE_CAPACITY", &mut c.queue_capacity)?;
        parse(&lookup, "LOOM_SYNC_POLL_INTERVAL_MS", &mut c.sync_poll_interval_ms)?;
        parse(&lookup, "LOOM_SYNC_MAX_BYTES", &mut c.sync_max_bytes)?;
        parse(&lookup, "LOOM_RETRY_BASE_DELAY_MS", &mut c.retry_base_delay_ms)?;
        parse(&lookup, "LOOM_MAX_BACKOFF_SECS", &mut c.max_backoff_secs)?;
        parse(&lookup, "LOOM_DEFAULT_BATCH_SIZE", &mut c.default_batch_size)?;
        parse(&lookup, "LOOM_DEFAULT_RETRY_COUNT", &mut c.default_retry_count)?;
        parse(&lookup, "LOOM_ZSTD_LEVEL", &mut c.zstd_level)?;
        parse(&lookup, "LOOM_ALERT_CHANNEL_CAPACITY", &mut c.alert_channel_capacity)?;
        Ok(c)
    }

    #[must_use]
    pub fn evaluator_interval(&self) -> Duration {
        Duration::from_secs(self.evaluator_interval_secs.max(1))
    }

    #[must_use]
    pub fn downsample_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.downsample_window_secs.max(1)).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.evaluator_interval_secs, 300);
        assert_eq!(c.downsample_window_secs, 3600);
        assert_eq!(c.sync_max_bytes, 1024 * 1024);
        assert_eq!(c.default_batch_size, 1000);
        assert_eq!(c.default_retry_count, 3);
        assert!(c.sql_url.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let c: EngineConfig = serde_json::from_str(r#"{"queue_capacity": 5}"#).unwrap();
        assert_eq!(c.queue_capacity, 5);
        assert_eq!(c.max_backoff_secs, 300);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LOOM_SQL_URL", "sqlite://x.db?mode=rwc"),
            ("LOOM_QUEUE_CAPACITY", "42"),
        ]
        .into_iter()
        .collect();
        let c = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.sql_url.as_deref(), Some("sqlite://x.db?mode=rwc"));
        assert_eq!(c.queue_capacity, 42);
        assert_eq!(c.zstd_level, 3);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = EngineConfig::from_lookup(|k| (k == "LOOM_MAX_BACKOFF_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.var, "LOOM_MAX_BACKOFF_SECS");
    }
}
