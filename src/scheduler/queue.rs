// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pair pending queue.
//!
//! Entries are kept sorted by tier (`CRITICAL` first), then insertion
//! order. Insertion order is the record's store ingestion time, so an
//! entry dropped under backpressure and re-enqueued later keeps its
//! place.
//!
//! Selecting a sync unit reorders only at the front: entries older than
//! their table's `max_delay_seconds` jump ahead of every tier.
//!
//! ```text
//!   queue:     [C1 C2 | H1 H2 H3 | L1*]       * L1 overdue
//!   unit:      [L1* C1 C2 H1 H2 H3]           capped per table, then by bytes
//! ```

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::record::{Record, RecordId};
use crate::registry::{SyncPolicy, SyncPriority};

use super::retry::RetryState;

/// Insertion order within a tier.
type Order = (DateTime<Utc>, DateTime<Utc>, RecordId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    tier: Reverse<SyncPriority>,
    order: Order,
}

/// A pending record waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: RecordId,
    pub table: String,
    pub priority: SyncPriority,
    pub ingested_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
}

impl QueueEntry {
    #[must_use]
    pub fn of(record: &Record, priority: SyncPriority) -> Self {
        Self {
            id: record.id,
            table: record.table.clone(),
            priority,
            ingested_at: record.ingested_at,
            timestamp: record.timestamp,
            size_bytes: record.size_bytes(),
        }
    }

    fn order(&self) -> Order {
        (self.ingested_at, self.timestamp, self.id)
    }

    fn key(&self) -> QueueKey {
        QueueKey { tier: Reverse(self.priority), order: self.order() }
    }

    /// Pending longer than the table allows.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>, max_delay: Option<std::time::Duration>) -> bool {
        let Some(max_delay) = max_delay.and_then(|d| chrono::Duration::from_std(d).ok()) else {
            return false;
        };
        now.signed_duration_since(self.ingested_at) > max_delay
    }
}

#[derive(Debug)]
pub struct PairQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<RecordId, QueueKey>,
    /// Survives shedding so a re-enqueued record keeps its attempts
    retries: HashMap<RecordId, RetryState>,
    capacity: usize,
}

impl PairQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            retries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.index.contains_key(&id)
    }

    /// Enqueue, returning false when the record is already queued.
    pub fn push(&mut self, entry: QueueEntry) -> bool {
        if self.index.contains_key(&entry.id) {
            return false;
        }
        let key = entry.key();
        self.index.insert(entry.id, key);
        self.entries.insert(key, entry);
        true
    }

    pub fn remove(&mut self, id: RecordId) -> Option<QueueEntry> {
        let key = self.index.remove(&id)?;
        self.entries.remove(&key)
    }

    /// Drop the lowest-tier, newest entries until within capacity.
    /// Returns how many were dropped. Retry state is kept.
    pub fn shed(&mut self) -> usize {
        let mut dropped = 0;
        while self.entries.len() > self.capacity {
            let Some((_, entry)) = self.entries.pop_last() else {
                break;
            };
            self.index.remove(&entry.id);
            dropped += 1;
        }
        dropped
    }

    #[must_use]
    pub fn attempts(&self, id: RecordId) -> u32 {
        self.retries.get(&id).map_or(0, |r| r.attempts)
    }

    #[must_use]
    pub fn retry_state(&self, id: RecordId) -> Option<&RetryState> {
        self.retries.get(&id)
    }

    pub fn set_retry(&mut self, id: RecordId, state: RetryState) {
        self.retries.insert(id, state);
    }

    /// Forget a record entirely: queue slot and attempts.
    pub fn forget(&mut self, id: RecordId) {
        self.remove(id);
        self.retries.remove(&id);
    }

    fn is_due(&self, id: RecordId, now: DateTime<Utc>) -> bool {
        self.retries.get(&id).map_or(true, |r| r.is_due(now))
    }

    /// Remove and return the next sync unit.
    ///
    /// Overdue entries come first in insertion order, then the rest in
    /// tier order. Each table contributes at most its `batch_size`. The
    /// unit stops before going over `max_bytes`, but always holds at
    /// least one entry when any is due.
    pub fn select(
        &mut self,
        now: DateTime<Utc>,
        max_bytes: usize,
        lookup: impl Fn(&str) -> SyncPolicy,
    ) -> Vec<QueueEntry> {
        let mut policies: HashMap<&str, SyncPolicy> = HashMap::new();
        let mut overdue = Vec::new();
        let mut in_tier = Vec::new();
        for entry in self.entries.values() {
            if !self.is_due(entry.id, now) {
                continue;
            }
            let policy = *policies.entry(entry.table.as_str()).or_insert_with(|| lookup(&entry.table));
            if entry.is_overdue(now, policy.max_delay) {
                overdue.push(entry);
            } else {
                in_tier.push(entry);
            }
        }
        overdue.sort_by_key(|e| e.order());

        let mut per_table: HashMap<&str, usize> = HashMap::new();
        let mut bytes = 0usize;
        let mut chosen = Vec::new();
        for entry in overdue.into_iter().chain(in_tier) {
            let cap = policies.get(entry.table.as_str()).map_or(1, |p| p.batch_size);
            let taken = per_table.entry(entry.table.as_str()).or_default();
            if *taken >= cap {
                continue;
            }
            if !chosen.is_empty() && bytes.saturating_add(entry.size_bytes) > max_bytes {
                break;
            }
            *taken += 1;
            bytes = bytes.saturating_add(entry.size_bytes);
            chosen.push(entry.id);
        }

        chosen.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
