// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend wrapper for tests that need storage to misbehave.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::memory::MemoryBackend;
use super::traits::{RecordBackend, ScanPosition, StorageError, TimeRange};
use crate::record::{KnownEntity, NoteReference, Record, RecordId, StreamKey};

/// In-memory backend with switchable batch-write failures and a fixed
/// footprint overhead (index pages, WAL) that eviction cannot reclaim.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    fail_batches: AtomicBool,
    overhead_bytes: AtomicU64,
}

impl FlakyBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put_batch` fail until switched back.
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    pub fn set_overhead_bytes(&self, bytes: u64) {
        self.overhead_bytes.store(bytes, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        self.inner.get(id).await
    }

    async fn find_by_key(&self, key: &StreamKey, timestamp: DateTime<Utc>) -> Result<Option<Record>, StorageError> {
        self.inner.find_by_key(key, timestamp).await
    }

    async fn put(&self, record: &Record) -> Result<(), StorageError> {
        self.inner.put(record).await
    }

    async fn put_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected batch write failure".into()));
        }
        self.inner.put_batch(records).await
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<usize, StorageError> {
        self.inner.delete(ids).await
    }

    async fn swap(&self, originals: &[RecordId], reduced: &[Record]) -> Result<(), StorageError> {
        self.inner.swap(originals, reduced).await
    }

    async fn scan(
        &self,
        key: &StreamKey,
        range: TimeRange,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError> {
        self.inner.scan(key, range, after, limit).await
    }

    async fn streams(&self) -> Result<Vec<StreamKey>, StorageError> {
        self.inner.streams().await
    }

    async fn footprint_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.inner.footprint_bytes().await? + self.overhead_bytes.load(Ordering::SeqCst))
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.inner.count().await
    }

    async fn find_note(&self, note_id: &str) -> Result<Option<RecordId>, StorageError> {
        self.inner.find_note(note_id).await
    }

    async fn put_entity(&self, entity: &KnownEntity) -> Result<(), StorageError> {
        self.inner.put_entity(entity).await
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<KnownEntity>, StorageError> {
        self.inner.get_entity(entity_id).await
    }

    async fn put_reference(&self, reference: &NoteReference) -> Result<bool, StorageError> {
        self.inner.put_reference(reference).await
    }

    async fn references_for_note(&self, note_id: &str) -> Result<Vec<NoteReference>, StorageError> {
        self.inner.references_for_note(note_id).await
    }
}
