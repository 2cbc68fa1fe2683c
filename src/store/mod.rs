// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record store facade.
//!
//! [`RecordStore`] sits between callers and a [`RecordBackend`]. It owns
//! everything a backend should not have to know about:
//!
//! - boundary validation and the one-kind-per-table binding
//! - referential integrity for notes and entity references
//! - idempotent upsert on `(device_id, table, timestamp)`
//! - per-stream write serialization
//! - decoding compressed bodies on read
//!
//! ```text
//!   append ──► validate ──► bind kind ──► check refs ──► lock stream ──► upsert
//!                                                           │
//!                              evaluator swap ─────────────►┤ (same lock)
//!                              sync marks ─────────────────►┘
//! ```
//!
//! Writes to one `(device, table)` stream are serialized by a
//! `tokio::sync::Mutex`; disjoint streams never contend.

mod graph;
mod maintenance;
pub mod query;
mod read;

pub use query::{Cursor, Page, QueryRequest, StatusFilter};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::compression::{decompress_body, CompressionError, PayloadCodec, StandardCodec};
use crate::metrics::{self, LatencyTimer};
use crate::record::{
    Device, Payload, PayloadKind, Record, RecordBody, RecordId, StreamKey, TypedRecord, ValidationError,
};
use crate::similarity::SimilarityError;
use crate::storage::traits::{RecordBackend, StorageError, TimeRange};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("referential integrity: {kind} `{id}` does not exist")]
    ReferentialIntegrity { kind: &'static str, id: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Similarity(#[from] SimilarityError),
}

/// What an upsert did with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppendOutcome {
    Inserted,
    Duplicate,
    MetadataReplaced,
}

impl AppendOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Duplicate => "duplicate",
            Self::MetadataReplaced => "metadata_replaced",
        }
    }
}

pub struct RecordStore {
    backend: Arc<dyn RecordBackend>,
    codec: Arc<dyn PayloadCodec>,
    clock: SharedClock,
    /// One async mutex per stream, created on first use
    stream_locks: DashMap<StreamKey, Arc<Mutex<()>>>,
    /// Payload kind each table is bound to
    table_kinds: DashMap<String, PayloadKind>,
    devices: DashMap<String, Device>,
    /// Set while storage is exhausted; appends still succeed
    degraded: AtomicBool,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn RecordBackend>) -> Self {
        Self {
            backend,
            codec: Arc::new(StandardCodec::default()),
            clock: Arc::new(SystemClock),
            stream_locks: DashMap::new(),
            table_kinds: DashMap::new(),
            devices: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &Arc<dyn RecordBackend> {
        &self.backend
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::AcqRel);
        if was != degraded {
            if degraded {
                warn!("Storage exhausted, ingestion continues in degraded mode");
            } else {
                debug!("Storage back under budget, leaving degraded mode");
            }
        }
    }

    pub(crate) fn stream_lock(&self, key: &StreamKey) -> Arc<Mutex<()>> {
        self.stream_locks.entry(key.clone()).or_default().clone()
    }

    /// Decode a compressed body so callers only ever see typed payloads.
    pub(crate) fn decode(&self, record: Record) -> Result<Record, StoreError> {
        if !matches!(record.body, RecordBody::Compressed { .. }) {
            return Ok(record);
        }
        let body = decompress_body(self.codec.as_ref(), record.body)?;
        Ok(Record { body, ..record })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ingestion
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist one record.
    ///
    /// Re-appending an existing `(device_id, table, timestamp)` returns the
    /// stored id and only replaces its metadata.
    #[tracing::instrument(skip(self, record), fields(table = %record.table(), device = %record.device_id()))]
    pub async fn append(&self, record: TypedRecord) -> Result<RecordId, StoreError> {
        let _timer = LatencyTimer::new("append");
        self.check_references(record.payload(), &HashSet::new()).await?;
        self.bind_table_kind(record.table(), record.kind()).await?;

        let key = record.key();
        let now = self.clock.now();
        let lock = self.stream_lock(&key);
        let (id, outcome) = {
            let _guard = lock.lock().await;
            match self.backend.find_by_key(&key, record.timestamp()).await? {
                Some(existing) => {
                    let outcome = Self::merge_duplicate(&existing, &record);
                    if outcome == AppendOutcome::MetadataReplaced {
                        let updated = Record { metadata: record.metadata().clone(), ..existing };
                        self.backend.put(&updated).await?;
                        (updated.id, outcome)
                    } else {
                        (existing.id, outcome)
                    }
                }
                None => {
                    let stored = record.into_record(RecordId::new(), now);
                    self.backend.put(&stored).await?;
                    (stored.id, AppendOutcome::Inserted)
                }
            }
        };

        if outcome != AppendOutcome::Inserted {
            debug!(record_id = %id, outcome = outcome.as_str(), "Duplicate append");
        }
        self.after_write(&key, &[outcome], now);
        Ok(id)
    }

    /// Persist many records.
    ///
    /// Every record is validated before anything is written; one bad record
    /// rejects the batch. Writes then land atomically per stream.
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    pub async fn append_batch(&self, records: Vec<TypedRecord>) -> Result<Vec<RecordId>, StoreError> {
        let _timer = LatencyTimer::new("append_batch");
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch_kinds: BTreeMap<&str, PayloadKind> = BTreeMap::new();
        for record in &records {
            let bound = *batch_kinds.entry(record.table()).or_insert(record.kind());
            if bound != record.kind() {
                return Err(kind_mismatch(record.table(), bound, record.kind()).into());
            }
        }
        for (table, kind) in &batch_kinds {
            if let Some(bound) = self.known_kind(table).await? {
                if bound != *kind {
                    return Err(kind_mismatch(table, bound, *kind).into());
                }
            }
        }
        let batch_notes: HashSet<&str> = records
            .iter()
            .filter_map(|r| match r.payload() {
                Payload::Note(note) => Some(note.id.as_str()),
                _ => None,
            })
            .collect();
        for record in &records {
            self.check_references(record.payload(), &batch_notes).await?;
        }
        let batch_kinds: Vec<(String, PayloadKind)> =
            batch_kinds.into_iter().map(|(t, k)| (t.to_string(), k)).collect();
        for (table, kind) in &batch_kinds {
            self.bind_table_kind(table, *kind).await?;
        }

        let total = records.len();
        let mut by_stream: BTreeMap<StreamKey, Vec<(usize, TypedRecord)>> = BTreeMap::new();
        for (index, record) in records.into_iter().enumerate() {
            by_stream.entry(record.key()).or_default().push((index, record));
        }

        let now = self.clock.now();
        let mut ids: Vec<Option<RecordId>> = vec![None; total];
        for (key, entries) in by_stream {
            let lock = self.stream_lock(&key);
            let _guard = lock.lock().await;

            let mut to_write: Vec<Record> = Vec::new();
            let mut by_timestamp: HashMap<DateTime<Utc>, usize> = HashMap::new();
            let mut outcomes = Vec::with_capacity(entries.len());
            for (index, record) in entries {
                let ts = record.timestamp();
                if let Some(&slot) = by_timestamp.get(&ts) {
                    let outcome = Self::merge_duplicate(&to_write[slot], &record);
                    to_write[slot].metadata = record.metadata().clone();
                    ids[index] = Some(to_write[slot].id);
                    outcomes.push(outcome);
                    continue;
                }
                let (stored, outcome) = match self.backend.find_by_key(&key, ts).await? {
                    Some(existing) => {
                        let outcome = Self::merge_duplicate(&existing, &record);
                        (Record { metadata: record.metadata().clone(), ..existing }, outcome)
                    }
                    None => (record.into_record(RecordId::new(), now), AppendOutcome::Inserted),
                };
                ids[index] = Some(stored.id);
                by_timestamp.insert(ts, to_write.len());
                to_write.push(stored);
                outcomes.push(outcome);
            }
            self.backend.put_batch(&to_write).await?;
            drop(_guard);
            self.after_write(&key, &outcomes, now);
        }

        Ok(ids.into_iter().flatten().collect())
    }

    fn merge_duplicate(existing: &Record, incoming: &TypedRecord) -> AppendOutcome {
        if existing.metadata == *incoming.metadata() {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::MetadataReplaced
        }
    }

    fn after_write(&self, key: &StreamKey, outcomes: &[AppendOutcome], now: DateTime<Utc>) {
        let degraded = self.is_degraded();
        for outcome in outcomes {
            metrics::record_append(&key.table, outcome.as_str());
            if degraded {
                metrics::record_degraded_append(&key.table);
            }
        }
        if degraded {
            warn!(stream = %key, count = outcomes.len(), "Append accepted while storage is exhausted");
        }
        self.touch_device(&key.device_id, now);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Table kinds and references
    // ═══════════════════════════════════════════════════════════════════════

    /// Kind a table is bound to, learning it from stored records if this
    /// process has not seen the table yet.
    async fn known_kind(&self, table: &str) -> Result<Option<PayloadKind>, StoreError> {
        if let Some(kind) = self.table_kinds.get(table) {
            return Ok(Some(*kind));
        }
        for key in self.backend.streams().await?.into_iter().filter(|k| k.table == table) {
            let first = self.backend.scan(&key, TimeRange::all(), None, 1).await?;
            if let Some(record) = first.first() {
                let kind = *self.table_kinds.entry(table.to_string()).or_insert(record.kind());
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    async fn bind_table_kind(&self, table: &str, kind: PayloadKind) -> Result<(), StoreError> {
        let bound = match self.known_kind(table).await? {
            Some(bound) => bound,
            None => *self.table_kinds.entry(table.to_string()).or_insert(kind),
        };
        if bound != kind {
            return Err(kind_mismatch(table, bound, kind).into());
        }
        Ok(())
    }

    /// Kind bound to `table`, if any record has been appended to it.
    pub async fn table_kind(&self, table: &str) -> Result<Option<PayloadKind>, StoreError> {
        self.known_kind(table).await
    }

    async fn check_references(&self, payload: &Payload, batch_notes: &HashSet<&str>) -> Result<(), StoreError> {
        match payload {
            Payload::Note(note) => {
                if let Some(parent) = &note.parent_id {
                    if !batch_notes.contains(parent.as_str()) && self.backend.find_note(parent).await?.is_none() {
                        return Err(StoreError::ReferentialIntegrity { kind: "note", id: parent.clone() });
                    }
                }
            }
            Payload::EntityReference(reference) => {
                self.require_live_entity(&reference.entity_id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) async fn require_live_entity(&self, entity_id: &str) -> Result<(), StoreError> {
        match self.backend.get_entity(entity_id).await? {
            Some(entity) if !entity.is_deleted() => Ok(()),
            _ => Err(StoreError::ReferentialIntegrity { kind: "entity", id: entity_id.to_string() }),
        }
    }
}

fn kind_mismatch(table: &str, bound: PayloadKind, got: PayloadKind) -> ValidationError {
    ValidationError::new("table", format!("`{table}` holds {bound} records, got {got}"))
}

/// Distinct ids, keeping first-seen order.
pub(crate) fn dedup_ids(ids: &[RecordId]) -> Vec<RecordId> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::note::Note;
    use crate::record::sensor::{GpsFix, Temperature};
    use crate::record::{EntityReference, Metadata};
    use crate::storage::memory::MemoryBackend;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryBackend::new()))
            .with_clock(Arc::new(ManualClock::new(start())))
    }

    fn gps(device: &str, ts: DateTime<Utc>) -> TypedRecord {
        TypedRecord::new("gps", device, ts, Payload::Gps(GpsFix::new(51.5, -0.1))).unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_id_and_ingested_at() {
        let store = store();
        let id = store.append(gps("phone", start())).await.unwrap();
        let rec = store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.ingested_at, start());
        assert_eq!(rec.table, "gps");
        assert!(rec.lineage.is_raw());
    }

    #[tokio::test]
    async fn test_duplicate_append_replaces_metadata_only() {
        let store = store();
        let first = gps("phone", start()).with_metadata(Metadata::new().with("v", 1i64).unwrap());
        let id = store.append(first).await.unwrap();

        let second = TypedRecord::new("gps", "phone", start(), Payload::Gps(GpsFix::new(1.0, 1.0)))
            .unwrap()
            .with_metadata(Metadata::new().with("v", 2i64).unwrap());
        let again = store.append(second).await.unwrap();
        assert_eq!(id, again);

        let rec = store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.metadata.get("v"), Some(&crate::record::MetadataValue::Int(2)));
        match rec.payload() {
            Some(Payload::Gps(fix)) => assert_eq!(fix.latitude, 51.5),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(store.backend().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_table_kind_is_fixed_by_first_append() {
        let store = store();
        store.append(gps("phone", start())).await.unwrap();
        let temp = TypedRecord::new(
            "gps",
            "phone",
            start() + chrono::Duration::seconds(1),
            Payload::Temperature(Temperature { celsius: 20.0 }),
        )
        .unwrap();
        let err = store.append(temp).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref e) if e.field == "table"), "{err}");
    }

    #[tokio::test]
    async fn test_batch_with_bad_record_writes_nothing() {
        let store = store();
        let good = gps("phone", start());
        let dangling = TypedRecord::new(
            "refs",
            "phone",
            start(),
            Payload::EntityReference(EntityReference::new("nobody")),
        )
        .unwrap();
        let err = store.append_batch(vec![good, dangling]).await.unwrap_err();
        assert!(matches!(err, StoreError::ReferentialIntegrity { kind: "entity", .. }));
        assert_eq!(store.backend().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_dedups_within_itself() {
        let store = store();
        let ids = store
            .append_batch(vec![gps("phone", start()), gps("phone", start()), gps("watch", start())])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
        assert_eq!(store.backend().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_note_parent_must_exist() {
        let store = store();
        let orphan = Note::new("child", "user", "hello").with_parent("missing");
        let rec = TypedRecord::new("notes", "phone", start(), Payload::Note(orphan)).unwrap();
        let err = store.append(rec).await.unwrap_err();
        assert!(matches!(err, StoreError::ReferentialIntegrity { kind: "note", ref id } if id == "missing"));

        let parent = TypedRecord::new("notes", "phone", start(), Payload::Note(Note::new("root", "user", "hi"))).unwrap();
        store.append(parent).await.unwrap();
        let child = Note::new("child", "user", "hello").with_parent("root");
        let rec = TypedRecord::new(
            "notes",
            "phone",
            start() + chrono::Duration::seconds(1),
            Payload::Note(child),
        )
        .unwrap();
        assert!(store.append(rec).await.is_ok());
    }

    #[tokio::test]
    async fn test_batch_may_reference_notes_in_same_batch() {
        let store = store();
        let parent = TypedRecord::new("notes", "phone", start(), Payload::Note(Note::new("a", "u", "x"))).unwrap();
        let child = TypedRecord::new(
            "notes",
            "phone",
            start() + chrono::Duration::seconds(1),
            Payload::Note(Note::new("b", "u", "y").with_parent("a")),
        )
        .unwrap();
        assert_eq!(store.append_batch(vec![child, parent]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_degraded_mode_still_accepts_appends() {
        let store = store();
        store.set_degraded(true);
        assert!(store.is_degraded());
        assert!(store.append(gps("phone", start())).await.is_ok());
        store.set_degraded(false);
        assert!(!store.is_degraded());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_appends_store_once() {
        let store = Arc::new(store());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.spawn(async move { store.append(gps("phone", start())).await });
        }
        let mut ids = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            ids.insert(joined.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.backend().count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disjoint_streams_lose_nothing() {
        let store = Arc::new(store());
        let mut tasks = tokio::task::JoinSet::new();
        for device in 0..8 {
            for secs in 0..16 {
                let store = store.clone();
                let ts = start() + chrono::Duration::seconds(secs);
                let record = if device % 2 == 0 {
                    gps(&format!("dev-{device}"), ts)
                } else {
                    TypedRecord::new("temp", format!("dev-{device}"), ts, Payload::Temperature(Temperature { celsius: 20.0 }))
                        .unwrap()
                };
                tasks.spawn(async move { store.append(record).await });
            }
        }
        let mut ids = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            ids.insert(joined.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 8 * 16);
        assert_eq!(store.backend().count().await.unwrap(), 8 * 16);
        assert_eq!(store.table_kind("temp").await.unwrap(), Some(PayloadKind::Temperature));
    }

    #[test]
    fn test_dedup_ids_keeps_order() {
        let a = RecordId::new();
        let b = RecordId::new();
        assert_eq!(dedup_ids(&[b, a, b, a]), vec![b, a]);
    }
}
