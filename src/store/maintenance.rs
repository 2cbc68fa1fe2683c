// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync marks and the primitives the retention evaluator builds on.
//!
//! Each primitive re-reads the records it was handed under the stream
//! lock and backs off when they changed since the caller's scan. The
//! caller does its expensive work (reduction, compression) unlocked and
//! simply retries on a later pass.

use std::collections::BTreeMap;

use tracing::debug;

use crate::record::{DevicePair, Record, RecordBody, RecordId, StreamKey};
use crate::storage::traits::{ScanPosition, TimeRange};

use super::{dedup_ids, RecordStore, StoreError};

impl RecordStore {
    // ═══════════════════════════════════════════════════════════════════════
    // Sync marks
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark records acknowledged by `pair`, returning how many were newly
    /// marked. Clears any failed-terminal mark for the pair. Unknown ids
    /// are ignored.
    pub async fn mark_synced(&self, ids: &[RecordId], pair: &DevicePair) -> Result<usize, StoreError> {
        self.update_marks(ids, |record| {
            record.failed_to.remove(pair);
            record.synced_to.insert(pair.clone())
        })
        .await
    }

    /// Record that `pair` gave up on these records. Already-synced records
    /// are left alone.
    pub async fn mark_failed_terminal(&self, ids: &[RecordId], pair: &DevicePair) -> Result<usize, StoreError> {
        self.update_marks(ids, |record| {
            !record.synced_to.contains(pair) && record.failed_to.insert(pair.clone())
        })
        .await
    }

    /// Drop the failed-terminal mark so the records become pending again.
    pub async fn clear_failed_terminal(&self, ids: &[RecordId], pair: &DevicePair) -> Result<usize, StoreError> {
        self.update_marks(ids, |record| record.failed_to.remove(pair)).await
    }

    async fn update_marks(
        &self,
        ids: &[RecordId],
        apply: impl Fn(&mut Record) -> bool,
    ) -> Result<usize, StoreError> {
        let mut by_stream: BTreeMap<StreamKey, Vec<RecordId>> = BTreeMap::new();
        for id in dedup_ids(ids) {
            if let Some(record) = self.backend.get(id).await? {
                by_stream.entry(record.key()).or_default().push(id);
            }
        }

        let mut counted = 0;
        for (key, ids) in by_stream {
            let lock = self.stream_lock(&key);
            let _guard = lock.lock().await;
            let mut changed = Vec::new();
            for id in ids {
                let Some(mut record) = self.backend.get(id).await? else {
                    continue;
                };
                let before = (record.synced_to.clone(), record.failed_to.clone());
                if apply(&mut record) {
                    counted += 1;
                }
                if record.synced_to != before.0 || record.failed_to != before.1 {
                    changed.push(record);
                }
            }
            if !changed.is_empty() {
                self.backend.put_batch(&changed).await?;
            }
        }
        Ok(counted)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Retention primitives
    // ═══════════════════════════════════════════════════════════════════════

    /// Raw scan of one stream. Bodies are returned as stored, so callers
    /// can tell compressed records apart.
    pub async fn scan_stream(
        &self,
        key: &StreamKey,
        range: TimeRange,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self.backend.scan(key, range, after, limit).await?)
    }

    /// Replace `originals` with `reduced`, writing before deleting.
    ///
    /// Returns false, changing nothing, when any original was modified or
    /// removed since it was read.
    pub async fn swap_window(&self, originals: &[Record], reduced: &[Record]) -> Result<bool, StoreError> {
        let Some(first) = originals.first() else {
            return Ok(false);
        };
        let key = first.key();
        let lock = self.stream_lock(&key);
        let _guard = lock.lock().await;
        for original in originals {
            let current = self.backend.get(original.id).await?;
            if current.as_ref() != Some(original) {
                debug!(stream = %key, record_id = %original.id, "Window changed since scan, skipping swap");
                return Ok(false);
            }
        }
        let ids: Vec<RecordId> = originals.iter().map(|r| r.id).collect();
        self.backend.swap(&ids, reduced).await?;
        Ok(true)
    }

    /// Swap in a new body for `snapshot`, keeping its current metadata and
    /// sync marks. Returns false when the body or lineage moved on.
    pub async fn replace_body(&self, snapshot: &Record, body: RecordBody) -> Result<bool, StoreError> {
        self.rewrite(snapshot, |record| record.body = body).await
    }

    pub(crate) async fn rewrite(
        &self,
        snapshot: &Record,
        apply: impl FnOnce(&mut Record),
    ) -> Result<bool, StoreError> {
        let key = snapshot.key();
        let lock = self.stream_lock(&key);
        let _guard = lock.lock().await;
        let Some(mut current) = self.backend.get(snapshot.id).await? else {
            return Ok(false);
        };
        if current.body != snapshot.body || current.lineage != snapshot.lineage {
            return Ok(false);
        }
        apply(&mut current);
        self.backend.put(&current).await?;
        Ok(true)
    }

    /// Delete records, returning how many were still present.
    pub async fn delete_records(&self, records: &[Record]) -> Result<usize, StoreError> {
        let mut by_stream: BTreeMap<StreamKey, Vec<RecordId>> = BTreeMap::new();
        for record in records {
            by_stream.entry(record.key()).or_default().push(record.id);
        }
        let mut deleted = 0;
        for (key, ids) in by_stream {
            deleted += self.delete_in_stream(&key, &ids).await?;
        }
        Ok(deleted)
    }

    pub(crate) async fn delete_in_stream(&self, key: &StreamKey, ids: &[RecordId]) -> Result<usize, StoreError> {
        let lock = self.stream_lock(key);
        let _guard = lock.lock().await;
        Ok(self.backend.delete(&dedup_ids(ids)).await?)
    }
}
