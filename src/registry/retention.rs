// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::compression::CompressionAlgorithm;
use crate::record::{Metadata, ValidationError};

/// Caller-supplied retention fields for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionSpec {
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default)]
    pub compression_algorithm: CompressionAlgorithm,
    /// Age before compression; compress on the first pass when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_after_days: Option<u32>,
    /// Unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downsample_after_days: Option<u32>,
    /// Fraction of records kept per window, in (0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downsample_ratio: Option<f64>,
    #[serde(default)]
    pub convert_to_text: bool,
    /// Contribution to the global storage budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_required_space_mb: Option<u64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RetentionSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, days) in [
            ("compress_after_days", self.compress_after_days),
            ("retention_days", self.retention_days),
            ("downsample_after_days", self.downsample_after_days),
        ] {
            if days == Some(0) {
                return Err(ValidationError::new(field, "must be positive"));
            }
        }
        if self.min_required_space_mb == Some(0) {
            return Err(ValidationError::new("min_required_space_mb", "must be positive"));
        }
        match (self.downsample_after_days, self.downsample_ratio) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ValidationError::new(
                    "downsample_ratio",
                    "downsample_after_days and downsample_ratio must be set together",
                ));
            }
            (Some(after), Some(ratio)) => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(ValidationError::new("downsample_ratio", format!("{ratio} is outside (0, 1]")));
                }
                if let Some(retention) = self.retention_days {
                    if after > retention {
                        return Err(ValidationError::new(
                            "downsample_after_days",
                            format!("{after} exceeds retention_days {retention}"),
                        ));
                    }
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn compresses(&self) -> bool {
        self.compression_enabled && self.compression_algorithm != CompressionAlgorithm::None
    }
}

/// Stored retention policy for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub table_name: String,
    #[serde(flatten)]
    pub spec: RetentionSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetentionConfig {
    /// Raw records strictly older than this are expired.
    #[must_use]
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.spec.retention_days.map(|d| now - days(d))
    }

    /// Windows ending at or before this are downsampled.
    #[must_use]
    pub fn downsample_cutoff(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, f64)> {
        match (self.spec.downsample_after_days, self.spec.downsample_ratio) {
            (Some(d), Some(ratio)) => Some((now - days(d), ratio)),
            _ => None,
        }
    }

    /// Records strictly older than this are compressed.
    #[must_use]
    pub fn compress_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.spec.compresses() {
            return None;
        }
        Some(self.spec.compress_after_days.map_or(now, |d| now - days(d)))
    }

    #[must_use]
    pub fn budget_bytes(&self) -> Option<u64> {
        self.spec.min_required_space_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

fn days(d: u32) -> Duration {
    Duration::days(i64::from(d))
}
