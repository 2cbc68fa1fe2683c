// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory record backend.
//!
//! Each stream is a `BTreeMap` ordered by `(timestamp, id)`, held in a
//! `DashMap` so disjoint streams never share a lock. A side index maps
//! record ids back to their stream position.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::traits::{RecordBackend, ScanPosition, StorageError, TimeRange};
use crate::record::{KnownEntity, NoteReference, Record, RecordId, StreamKey};

type StreamLog = BTreeMap<(DateTime<Utc>, RecordId), Record>;
type ReferenceKey = (String, String, String);

#[derive(Debug, Clone)]
struct IndexEntry {
    key: StreamKey,
    timestamp: DateTime<Utc>,
    note_id: Option<String>,
}

pub struct MemoryBackend {
    streams: DashMap<StreamKey, StreamLog>,
    index: DashMap<RecordId, IndexEntry>,
    notes: DashMap<String, RecordId>,
    entities: DashMap<String, KnownEntity>,
    references: DashMap<ReferenceKey, NoteReference>,
    footprint: AtomicU64,
    /// Serializes multi-record writes so a batch is all-or-nothing to readers
    batch_lock: Mutex<()>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            index: DashMap::new(),
            notes: DashMap::new(),
            entities: DashMap::new(),
            references: DashMap::new(),
            footprint: AtomicU64::new(0),
            batch_lock: Mutex::new(()),
        }
    }

    /// Get current record count
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn insert_one(&self, record: &Record) {
        // Compressed note bodies keep their previous index entry
        let previous_note = self.index.get(&record.id).and_then(|e| e.note_id.clone());
        // Same id already stored: drop the old copy first
        self.remove_one(record.id, true);

        let key = record.key();
        let size = record.size_bytes() as u64;
        let note_id = record.note_id().map(str::to_string).or(previous_note);
        if let Some(n) = &note_id {
            self.notes.insert(n.clone(), record.id);
        }
        self.streams
            .entry(key.clone())
            .or_default()
            .insert((record.timestamp, record.id), record.clone());
        self.index.insert(record.id, IndexEntry { key, timestamp: record.timestamp, note_id });
        self.footprint.fetch_add(size, Ordering::Relaxed);
    }

    fn remove_one(&self, id: RecordId, keep_note: bool) -> bool {
        let Some((_, entry)) = self.index.remove(&id) else {
            return false;
        };
        let mut emptied = false;
        if let Some(mut log) = self.streams.get_mut(&entry.key) {
            if let Some(old) = log.remove(&(entry.timestamp, id)) {
                self.footprint.fetch_sub(old.size_bytes() as u64, Ordering::Relaxed);
            }
            emptied = log.is_empty();
        }
        if emptied {
            self.streams.remove_if(&entry.key, |_, log| log.is_empty());
        }
        if !keep_note {
            if let Some(n) = entry.note_id {
                self.notes.remove_if(&n, |_, v| *v == id);
            }
        }
        true
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let Some(entry) = self.index.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(self
            .streams
            .get(&entry.key)
            .and_then(|log| log.get(&(entry.timestamp, id)).cloned()))
    }

    async fn find_by_key(
        &self,
        key: &StreamKey,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Record>, StorageError> {
        let Some(log) = self.streams.get(key) else {
            return Ok(None);
        };
        let start = (timestamp, RecordId::from_uuid(Uuid::nil()));
        Ok(log
            .range((Bound::Included(start), Bound::Unbounded))
            .next()
            .filter(|((ts, _), _)| *ts == timestamp)
            .map(|(_, r)| r.clone()))
    }

    async fn put(&self, record: &Record) -> Result<(), StorageError> {
        let _guard = self.batch_lock.lock();
        self.insert_one(record);
        Ok(())
    }

    async fn put_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        let _guard = self.batch_lock.lock();
        for record in records {
            self.insert_one(record);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<usize, StorageError> {
        let _guard = self.batch_lock.lock();
        Ok(ids.iter().filter(|id| self.remove_one(**id, false)).count())
    }

    async fn swap(&self, originals: &[RecordId], reduced: &[Record]) -> Result<(), StorageError> {
        let _guard = self.batch_lock.lock();
        for record in reduced {
            self.insert_one(record);
        }
        for id in originals {
            self.remove_one(*id, false);
        }
        Ok(())
    }

    async fn scan(
        &self,
        key: &StreamKey,
        range: TimeRange,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError> {
        let Some(log) = self.streams.get(key) else {
            return Ok(Vec::new());
        };
        let lower = match (after, range.since) {
            (Some(pos), _) => Bound::Excluded((pos.timestamp, pos.id)),
            (None, Some(since)) => Bound::Included((since, RecordId::from_uuid(Uuid::nil()))),
            (None, None) => Bound::Unbounded,
        };
        Ok(log
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| range.since.map_or(true, |s| r.timestamp >= s))
            .take_while(|r| range.until.map_or(true, |u| r.timestamp < u))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn streams(&self) -> Result<Vec<StreamKey>, StorageError> {
        let mut keys: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn footprint_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.footprint.load(Ordering::Relaxed))
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.index.len() as u64)
    }

    async fn find_note(&self, note_id: &str) -> Result<Option<RecordId>, StorageError> {
        Ok(self.notes.get(note_id).map(|e| *e.value()))
    }

    async fn put_entity(&self, entity: &KnownEntity) -> Result<(), StorageError> {
        self.entities.insert(entity.entity_id.clone(), entity.clone());
        Ok(())
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<KnownEntity>, StorageError> {
        Ok(self.entities.get(entity_id).map(|e| e.value().clone()))
    }

    async fn put_reference(&self, reference: &NoteReference) -> Result<bool, StorageError> {
        let (n, t, r) = reference.key();
        let key = (n.to_string(), t.to_string(), r.to_string());
        match self.references.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(reference.clone());
                Ok(true)
            }
        }
    }

    async fn references_for_note(&self, note_id: &str) -> Result<Vec<NoteReference>, StorageError> {
        let mut refs: Vec<NoteReference> = self
            .references
            .iter()
            .filter(|e| e.key().0 == note_id)
            .map(|e| e.value().clone())
            .collect();
        refs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.reference_id.cmp(&b.reference_id)));
        Ok(refs)
    }
}
