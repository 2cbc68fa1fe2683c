// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Emergency eviction planning.
//!
//! Victims are chosen by a fixed order rather than a score:
//!
//! 1. table sync tier, `BACKGROUND` first
//! 2. table name, for ties between tables of one tier
//! 3. unsynced records before synced ones
//! 4. oldest first
//!
//! Every record is a candidate, `CRITICAL` tables included; they are
//! simply reached last. Selection stops as soon as the freed bytes cover
//! the excess.

use chrono::{DateTime, Utc};

use crate::record::{Record, RecordId, StreamKey};
use crate::registry::SyncPriority;

/// Metadata of a record that may be evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub id: RecordId,
    pub key: StreamKey,
    pub priority: SyncPriority,
    /// Acknowledged by at least one pair
    pub synced: bool,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
}

impl EvictionCandidate {
    #[must_use]
    pub fn of(record: &Record, priority: SyncPriority) -> Self {
        Self {
            id: record.id,
            key: record.key(),
            priority,
            synced: record.is_synced_anywhere(),
            timestamp: record.timestamp,
            size_bytes: record.size_bytes() as u64,
        }
    }

    fn sort_key(&self) -> (SyncPriority, &str, bool, DateTime<Utc>, RecordId) {
        (self.priority, &self.key.table, self.synced, self.timestamp, self.id)
    }
}

/// Pick victims until at least `bytes_to_free` would be released.
///
/// Returns the victims in eviction order and the bytes they free. When
/// every evictable candidate is selected and the total still falls
/// short, the caller is out of evictable storage.
#[must_use]
pub fn select_victims(mut candidates: Vec<EvictionCandidate>, bytes_to_free: u64) -> (Vec<EvictionCandidate>, u64) {
    if bytes_to_free == 0 {
        return (Vec::new(), 0);
    }
    candidates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for candidate in candidates {
        if freed >= bytes_to_free {
            break;
        }
        freed = freed.saturating_add(candidate.size_bytes);
        victims.push(candidate);
    }
    (victims, freed)
}
