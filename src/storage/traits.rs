// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{KnownEntity, NoteReference, Record, RecordId, StreamKey};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Half-open timestamp range `[since, until)`. `None` is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn before(until: DateTime<Utc>) -> Self {
        Self { since: None, until: Some(until) }
    }

    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| ts >= s) && self.until.map_or(true, |u| ts < u)
    }
}

/// Position in a stream's `(timestamp, id)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanPosition {
    pub timestamp: DateTime<Utc>,
    pub id: RecordId,
}

impl ScanPosition {
    #[must_use]
    pub fn of(record: &Record) -> Self {
        Self { timestamp: record.timestamp, id: record.id }
    }
}

/// Durable home of records, entities and note references.
///
/// Backends are not responsible for validation or per-stream locking;
/// [`crate::RecordStore`] does both before calling in.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Short name for logs and metrics
    fn name(&self) -> &'static str;

    async fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError>;

    /// Record stored at the dedup key `(device_id, table, timestamp)`.
    async fn find_by_key(
        &self,
        key: &StreamKey,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Record>, StorageError>;

    /// Insert, or replace the record with the same id.
    async fn put(&self, record: &Record) -> Result<(), StorageError>;

    /// Write all records or none.
    async fn put_batch(&self, records: &[Record]) -> Result<(), StorageError>;

    /// Remove records by id, returning how many existed.
    async fn delete(&self, ids: &[RecordId]) -> Result<usize, StorageError>;

    /// Write `reduced`, then delete `originals`, as one unit where the
    /// backend supports it. Never deletes before the write succeeded.
    async fn swap(&self, originals: &[RecordId], reduced: &[Record]) -> Result<(), StorageError>;

    /// One stream in `(timestamp, id)` order: inside `range`, strictly
    /// after `after`, at most `limit` records.
    async fn scan(
        &self,
        key: &StreamKey,
        range: TimeRange,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError>;

    /// Every stream holding at least one record
    async fn streams(&self) -> Result<Vec<StreamKey>, StorageError>;

    /// Sum of [`Record::size_bytes`] over stored records
    async fn footprint_bytes(&self) -> Result<u64, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    /// Record id of the note record carrying `note_id`
    async fn find_note(&self, note_id: &str) -> Result<Option<RecordId>, StorageError>;

    async fn put_entity(&self, entity: &KnownEntity) -> Result<(), StorageError>;

    async fn get_entity(&self, entity_id: &str) -> Result<Option<KnownEntity>, StorageError>;

    /// Insert a join row. Returns false when the same
    /// `(note_id, reference_type, reference_id)` already existed.
    async fn put_reference(&self, reference: &NoteReference) -> Result<bool, StorageError>;

    async fn references_for_note(&self, note_id: &str) -> Result<Vec<NoteReference>, StorageError>;
}
