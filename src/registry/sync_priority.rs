// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Metadata, ValidationError};

/// Sync tier. Declared lowest first so the derived `Ord` ranks
/// `Critical` highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPriority {
    #[default]
    Background,
    Low,
    Medium,
    High,
    Critical,
}

impl SyncPriority {
    /// Drain order, highest tier first
    pub const DRAIN_ORDER: [SyncPriority; 5] =
        [Self::Critical, Self::High, Self::Medium, Self::Low, Self::Background];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_retry_count() -> u32 {
    3
}

/// Caller-supplied sync fields for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPrioritySpec {
    pub priority: SyncPriority,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pending age after which records jump ahead of every tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<u64>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SyncPrioritySpec {
    #[must_use]
    pub fn new(priority: SyncPriority) -> Self {
        Self {
            priority,
            batch_size: default_batch_size(),
            max_delay_seconds: None,
            retry_count: default_retry_count(),
            metadata: Metadata::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::new("batch_size", "must be at least 1"));
        }
        if self.retry_count == 0 {
            return Err(ValidationError::new("retry_count", "must be at least 1"));
        }
        if self.max_delay_seconds == Some(0) {
            return Err(ValidationError::new("max_delay_seconds", "must be positive"));
        }
        Ok(())
    }
}

/// Stored sync policy for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPriorityConfig {
    pub table_name: String,
    #[serde(flatten)]
    pub spec: SyncPrioritySpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Policy values for tables with no sync config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDefaults {
    pub batch_size: usize,
    pub retry_count: u32,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self { batch_size: default_batch_size(), retry_count: default_retry_count() }
    }
}

/// Resolved policy the scheduler applies to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub priority: SyncPriority,
    pub batch_size: usize,
    pub max_delay: Option<Duration>,
    pub retry_count: u32,
}

impl SyncPolicy {
    #[must_use]
    pub fn fallback(defaults: SyncDefaults) -> Self {
        Self {
            priority: SyncPriority::Background,
            batch_size: defaults.batch_size.max(1),
            max_delay: None,
            retry_count: defaults.retry_count.max(1),
        }
    }
}

impl From<&SyncPrioritySpec> for SyncPolicy {
    fn from(spec: &SyncPrioritySpec) -> Self {
        Self {
            priority: spec.priority,
            batch_size: spec.batch_size,
            max_delay: spec.max_delay_seconds.map(Duration::from_secs),
            retry_count: spec.retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        assert!(SyncPriority::Critical > SyncPriority::High);
        assert!(SyncPriority::Low > SyncPriority::Background);
        let mut sorted = SyncPriority::DRAIN_ORDER;
        sorted.sort();
        sorted.reverse();
        assert_eq!(sorted, SyncPriority::DRAIN_ORDER);
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: SyncPrioritySpec = serde_json::from_str(r#"{"priority": "HIGH"}"#).unwrap();
        assert_eq!(spec.batch_size, 1000);
        assert_eq!(spec.retry_count, 3);
        assert!(spec.max_delay_seconds.is_none());
    }

    #[test]
    fn test_spec_validation() {
        let ok = SyncPrioritySpec::new(SyncPriority::Low);
        assert!(ok.validate().is_ok());
        assert!(SyncPrioritySpec { batch_size: 0, ..ok.clone() }.validate().is_err());
        assert!(SyncPrioritySpec { retry_count: 0, ..ok.clone() }.validate().is_err());
        assert!(SyncPrioritySpec { max_delay_seconds: Some(0), ..ok }.validate().is_err());
    }

    #[test]
    fn test_fallback_is_background() {
        let policy = SyncPolicy::fallback(SyncDefaults { batch_size: 50, retry_count: 2 });
        assert_eq!(policy.priority, SyncPriority::Background);
        assert_eq!(policy.batch_size, 50);
        assert!(policy.max_delay.is_none());
    }
}
