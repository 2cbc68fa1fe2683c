// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One sync unit: the records handed to a transport in a single exchange.
//!
//! A unit can mix tables; each table's share is listed in `tables` so the
//! receiving side can see per-table caps were respected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::record::{DevicePair, Record, RecordId};
use crate::registry::SyncPriority;

/// The ids one table contributed to a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableBatch {
    pub table: String,
    pub priority: SyncPriority,
    pub record_ids: Vec<RecordId>,
}

/// Records in delivery order, plus per-table grouping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncBatch {
    pub batch_id: Uuid,
    pub pair: DevicePair,
    pub records: Vec<Record>,
    pub tables: Vec<TableBatch>,
    pub total_bytes: usize,
    pub created_at: DateTime<Utc>,
}

impl SyncBatch {
    #[must_use]
    pub fn new(batch_id: Uuid, pair: DevicePair, created_at: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            pair,
            records: Vec::new(),
            tables: Vec::new(),
            total_bytes: 0,
            created_at,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, record: Record, priority: SyncPriority) {
        match self.tables.iter_mut().find(|t| t.table == record.table) {
            Some(table) => table.record_ids.push(record.id),
            None => self.tables.push(TableBatch {
                table: record.table.clone(),
                priority,
                record_ids: vec![record.id],
            }),
        }
        self.total_bytes += record.size_bytes();
        self.records.push(record);
    }

    #[must_use]
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Ids of one table in this unit.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableBatch> {
        self.tables.iter().find(|t| t.table == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sensor::GpsFix;
    use crate::record::{Lineage, Metadata, Payload, RecordBody};
    use std::collections::BTreeSet;

    fn record(table: &str) -> Record {
        let now = Utc::now();
        Record {
            id: RecordId::new(),
            table: table.into(),
            device_id: "phone".into(),
            timestamp: now,
            ingested_at: now,
            metadata: Metadata::new(),
            body: RecordBody::Typed(Payload::Gps(GpsFix::new(1.0, 2.0))),
            lineage: Lineage::Raw,
            synced_to: BTreeSet::new(),
            failed_to: BTreeSet::new(),
        }
    }

    #[test]
    fn test_groups_by_table_in_first_seen_order() {
        let mut batch = SyncBatch::new(Uuid::new_v4(), DevicePair::new("phone", "laptop"), Utc::now());
        assert!(batch.is_empty());

        let a = record("gps");
        let b = record("location");
        let c = record("gps");
        let expected_bytes = a.size_bytes() + b.size_bytes() + c.size_bytes();
        batch.push(a.clone(), SyncPriority::High);
        batch.push(b.clone(), SyncPriority::Low);
        batch.push(c.clone(), SyncPriority::High);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.record_ids(), vec![a.id, b.id, c.id]);
        assert_eq!(batch.tables.iter().map(|t| t.table.as_str()).collect::<Vec<_>>(), vec!["gps", "location"]);
        assert_eq!(batch.table("gps").unwrap().record_ids, vec![a.id, c.id]);
        assert_eq!(batch.total_bytes, expected_bytes);
    }
}
