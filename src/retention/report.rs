// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! What a retention pass did.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::OperatorAlert;
use crate::backpressure::StoragePressure;
use crate::record::RecordId;

/// Per-record result worth reporting individually.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Compression failed verification; the plaintext was kept
    CompressionSkipped { record_id: RecordId, error: String },
}

/// Counters for one evaluated table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableCounts {
    /// Windows replaced by derived records
    pub windows_downsampled: usize,
    /// Raw records removed by downsampling
    pub records_downsampled: usize,
    /// Derived records written
    pub derived_written: usize,
    pub expired: usize,
    pub summarized: usize,
    pub compressed: usize,
    pub skipped: Vec<RecordOutcome>,
}

impl TableCounts {
    /// Stored records created, removed or rewritten
    #[must_use]
    pub fn changes(&self) -> usize {
        self.records_downsampled + self.derived_written + self.expired + self.summarized + self.compressed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Evaluated(TableCounts),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    pub budget_bytes: u64,
    pub footprint_before: u64,
    pub footprint_after: u64,
    pub evicted: usize,
    pub evicted_by_table: BTreeMap<String, usize>,
    /// Tier the footprint sits in once eviction is done
    pub pressure: StoragePressure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    /// Registry version the pass evaluated against
    pub registry_version: u64,
    pub tables: Vec<TableReport>,
    /// Present when a storage budget is configured
    pub eviction: Option<EvictionReport>,
    /// Raised when eviction could not get under budget
    pub alert: Option<OperatorAlert>,
}

impl PassReport {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == name).map(|t| &t.outcome)
    }

    #[must_use]
    pub fn counts(&self, name: &str) -> Option<&TableCounts> {
        match self.table(name)? {
            TableOutcome::Evaluated(counts) => Some(counts),
            TableOutcome::Failed { .. } => None,
        }
    }

    #[must_use]
    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| matches!(t.outcome, TableOutcome::Failed { .. }))
            .map(|t| t.table.as_str())
            .collect()
    }

    /// Total stored records touched by the pass, including evictions.
    #[must_use]
    pub fn changes(&self) -> usize {
        let tables: usize = self
            .tables
            .iter()
            .filter_map(|t| match &t.outcome {
                TableOutcome::Evaluated(c) => Some(c.changes()),
                TableOutcome::Failed { .. } => None,
            })
            .sum();
        tables + self.eviction.as_ref().map_or(0, |e| e.evicted)
    }

    #[must_use]
    pub fn storage_exhausted(&self) -> bool {
        matches!(self.alert, Some(OperatorAlert::StorageExhausted { .. }))
    }
}
