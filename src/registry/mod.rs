// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table retention and sync policies.
//!
//! The registry publishes immutable [`RegistrySnapshot`]s through a
//! `tokio::sync::watch` channel. Every successful change produces a new
//! snapshot with a higher `version`; readers that grabbed an older one
//! (a retention pass, a sync worker composing a unit) keep using it
//! until they finish.
//!
//! Rows are versioned too: `created_at` is kept across updates and
//! `updated_at` strictly increases per row, even if the clock stalls.

pub mod retention;
pub mod sync_priority;

pub use retention::{RetentionConfig, RetentionSpec};
pub use sync_priority::{SyncDefaults, SyncPolicy, SyncPriority, SyncPriorityConfig, SyncPrioritySpec};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::clock::SharedClock;
use crate::record::{validate_table_name, ValidationError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Point-in-time view of every policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub retention: BTreeMap<String, RetentionConfig>,
    pub sync_priority: BTreeMap<String, SyncPriorityConfig>,
    pub defaults: SyncDefaults,
}

impl RegistrySnapshot {
    fn empty(defaults: SyncDefaults) -> Self {
        Self { version: 0, retention: BTreeMap::new(), sync_priority: BTreeMap::new(), defaults }
    }

    #[must_use]
    pub fn retention(&self, table: &str) -> Option<&RetentionConfig> {
        self.retention.get(table)
    }

    #[must_use]
    pub fn sync_priority(&self, table: &str) -> Option<&SyncPriorityConfig> {
        self.sync_priority.get(table)
    }

    /// Effective sync policy, falling back to Background with engine defaults.
    #[must_use]
    pub fn sync_policy(&self, table: &str) -> SyncPolicy {
        self.sync_priority
            .get(table)
            .map_or_else(|| SyncPolicy::fallback(self.defaults), |c| SyncPolicy::from(&c.spec))
    }

    /// Sum of `min_required_space_mb` over configs that declare it.
    #[must_use]
    pub fn storage_budget_bytes(&self) -> Option<u64> {
        self.retention
            .values()
            .filter_map(RetentionConfig::budget_bytes)
            .reduce(u64::saturating_add)
    }
}

/// Import/export document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    retention_configs: Vec<RetentionConfig>,
    #[serde(default)]
    sync_priority_configs: Vec<SyncPriorityConfig>,
}

pub struct ConfigRegistry {
    clock: SharedClock,
    tx: watch::Sender<Arc<RegistrySnapshot>>,
    /// Serializes writers; never held across an await
    write_lock: Mutex<()>,
}

impl ConfigRegistry {
    pub fn new(clock: SharedClock, defaults: SyncDefaults) -> Self {
        let (tx, _) = watch::channel(Arc::new(RegistrySnapshot::empty(defaults)));
        Self { clock, tx, write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.tx.subscribe()
    }

    pub fn retention(&self, table: &str) -> Option<RetentionConfig> {
        self.snapshot().retention(table).cloned()
    }

    pub fn sync_priority(&self, table: &str) -> Option<SyncPriorityConfig> {
        self.snapshot().sync_priority(table).cloned()
    }

    /// Create or update a table's retention policy.
    pub fn upsert_retention(&self, table: &str, spec: RetentionSpec) -> Result<RetentionConfig, ConfigError> {
        validate_table_name(table)?;
        spec.validate()?;
        let now = self.clock.now();
        let config = self.publish(|snap| {
            let (created_at, updated_at) = row_times(snap.retention.get(table).map(|c| (c.created_at, c.updated_at)), now);
            let config = RetentionConfig { table_name: table.to_string(), spec, created_at, updated_at };
            snap.retention.insert(table.to_string(), config.clone());
            config
        });
        info!(table, "Retention config updated");
        Ok(config)
    }

    /// Create or update a table's sync policy.
    pub fn upsert_sync_priority(
        &self,
        table: &str,
        spec: SyncPrioritySpec,
    ) -> Result<SyncPriorityConfig, ConfigError> {
        validate_table_name(table)?;
        spec.validate()?;
        let now = self.clock.now();
        let config = self.publish(|snap| {
            let (created_at, updated_at) =
                row_times(snap.sync_priority.get(table).map(|c| (c.created_at, c.updated_at)), now);
            let config = SyncPriorityConfig { table_name: table.to_string(), spec, created_at, updated_at };
            snap.sync_priority.insert(table.to_string(), config.clone());
            config
        });
        info!(table, priority = %config.spec.priority, "Sync priority config updated");
        Ok(config)
    }

    pub fn remove_retention(&self, table: &str) -> Option<RetentionConfig> {
        if self.snapshot().retention(table).is_none() {
            return None;
        }
        self.publish(|snap| snap.retention.remove(table))
    }

    pub fn remove_sync_priority(&self, table: &str) -> Option<SyncPriorityConfig> {
        if self.snapshot().sync_priority(table).is_none() {
            return None;
        }
        self.publish(|snap| snap.sync_priority.remove(table))
    }

    /// Import config lists, replacing rows for the tables they name.
    ///
    /// All rows are validated first; on any error nothing changes.
    /// Returns how many rows were applied.
    pub fn load_json(&self, json: &str) -> Result<usize, ConfigError> {
        let doc: RegistryDocument = serde_json::from_str(json)?;
        let mut seen = BTreeSet::new();
        for config in &doc.retention_configs {
            validate_table_name(&config.table_name)?;
            config.spec.validate()?;
            if !seen.insert(("retention", config.table_name.as_str())) {
                return Err(duplicate_row(&config.table_name).into());
            }
        }
        for config in &doc.sync_priority_configs {
            validate_table_name(&config.table_name)?;
            config.spec.validate()?;
            if !seen.insert(("sync_priority", config.table_name.as_str())) {
                return Err(duplicate_row(&config.table_name).into());
            }
        }

        let applied = doc.retention_configs.len() + doc.sync_priority_configs.len();
        self.publish(|snap| {
            for mut config in doc.retention_configs {
                if let Some(existing) = snap.retention.get(&config.table_name) {
                    config.updated_at = config.updated_at.max(next_instant(existing.updated_at));
                }
                snap.retention.insert(config.table_name.clone(), config);
            }
            for mut config in doc.sync_priority_configs {
                if let Some(existing) = snap.sync_priority.get(&config.table_name) {
                    config.updated_at = config.updated_at.max(next_instant(existing.updated_at));
                }
                snap.sync_priority.insert(config.table_name.clone(), config);
            }
        });
        info!(rows = applied, "Imported registry configs");
        Ok(applied)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        let snap = self.snapshot();
        let doc = RegistryDocument {
            retention_configs: snap.retention.values().cloned().collect(),
            sync_priority_configs: snap.sync_priority.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Apply `change` to a copy of the current snapshot and publish it.
    fn publish<T>(&self, change: impl FnOnce(&mut RegistrySnapshot) -> T) -> T {
        let _guard = self.write_lock.lock();
        let mut next = RegistrySnapshot::clone(&self.tx.borrow());
        let out = change(&mut next);
        next.version += 1;
        self.tx.send_replace(Arc::new(next));
        out
    }
}

/// `(created_at, updated_at)` for a row written at `now`.
fn row_times(existing: Option<(DateTime<Utc>, DateTime<Utc>)>, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    match existing {
        Some((created_at, updated_at)) => (created_at, now.max(next_instant(updated_at))),
        None => (now, now),
    }
}

fn next_instant(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts + Duration::microseconds(1)
}

fn duplicate_row(table: &str) -> ValidationError {
    ValidationError::new("table_name", format!("`{table}` appears more than once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::TimeZone;

    fn registry() -> (ConfigRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()));
        (ConfigRegistry::new(clock.clone(), SyncDefaults::default()), clock)
    }

    fn spec(days: u32) -> RetentionSpec {
        RetentionSpec { retention_days: Some(days), ..RetentionSpec::default() }
    }

    #[test]
    fn test_upsert_preserves_created_and_bumps_updated() {
        let (registry, clock) = registry();
        let first = registry.upsert_retention("gps", spec(30)).unwrap();
        assert_eq!(first.created_at, first.updated_at);

        // Same instant: updated_at still moves forward
        let second = registry.upsert_retention("gps", spec(10)).unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);

        clock.advance(Duration::hours(1));
        let third = registry.upsert_retention("gps", spec(5)).unwrap();
        assert_eq!(third.updated_at, clock.now());
        assert_eq!(registry.retention("gps").unwrap().spec.retention_days, Some(5));
    }

    #[test]
    fn test_invalid_upsert_leaves_registry_unchanged() {
        let (registry, _) = registry();
        registry.upsert_retention("gps", spec(30)).unwrap();
        let before = registry.snapshot();

        let bad = RetentionSpec { downsample_after_days: Some(40), downsample_ratio: Some(0.5), ..spec(30) };
        assert!(matches!(registry.upsert_retention("gps", bad), Err(ConfigError::Validation(_))));
        assert!(registry.upsert_retention("Bad-Name", spec(1)).is_err());
        assert_eq!(*registry.snapshot(), *before);
    }

    #[test]
    fn test_snapshot_is_immutable_and_versioned() {
        let (registry, _) = registry();
        let rx = registry.subscribe();
        let old = registry.snapshot();
        registry
            .upsert_sync_priority("hr", SyncPrioritySpec::new(SyncPriority::Critical))
            .unwrap();
        assert_eq!(old.version, 0);
        assert!(old.sync_priority("hr").is_none());
        assert_eq!(rx.borrow().version, 1);
        assert_eq!(registry.snapshot().sync_policy("hr").priority, SyncPriority::Critical);
        assert_eq!(registry.snapshot().sync_policy("other").priority, SyncPriority::Background);
    }

    #[test]
    fn test_remove_bumps_version_only_when_present() {
        let (registry, _) = registry();
        assert!(registry.remove_retention("gps").is_none());
        assert_eq!(registry.snapshot().version, 0);
        registry.upsert_retention("gps", spec(3)).unwrap();
        assert!(registry.remove_retention("gps").is_some());
        assert_eq!(registry.snapshot().version, 2);
    }

    #[test]
    fn test_budget_sums_declared_space() {
        let (registry, _) = registry();
        assert_eq!(registry.snapshot().storage_budget_bytes(), None);
        registry
            .upsert_retention("a", RetentionSpec { min_required_space_mb: Some(1), ..RetentionSpec::default() })
            .unwrap();
        registry
            .upsert_retention("b", RetentionSpec { min_required_space_mb: Some(2), ..RetentionSpec::default() })
            .unwrap();
        registry.upsert_retention("c", spec(1)).unwrap();
        assert_eq!(registry.snapshot().storage_budget_bytes(), Some(3 * 1024 * 1024));
    }

    #[test]
    fn test_json_round_trip_and_atomic_import() {
        let (registry, _) = registry();
        registry.upsert_retention("gps", spec(30)).unwrap();
        registry
            .upsert_sync_priority("gps", SyncPrioritySpec::new(SyncPriority::High))
            .unwrap();
        let json = registry.to_json().unwrap();

        let (other, _) = self::registry();
        assert_eq!(other.load_json(&json).unwrap(), 2);
        assert_eq!(other.retention("gps"), registry.retention("gps"));

        let bad = r#"{"retention_configs": [
            {"table_name": "ok", "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"},
            {"table_name": "bad", "downsample_ratio": 2.0, "downsample_after_days": 1,
             "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"}
        ]}"#;
        let version = other.snapshot().version;
        assert!(other.load_json(bad).is_err());
        assert!(other.retention("ok").is_none());
        assert_eq!(other.snapshot().version, version);
    }
}
