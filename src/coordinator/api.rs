// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public API of the engine.
//!
//! Thin delegation to the store, registry, evaluator and scheduler. Every
//! call is refused once the engine is `Stopped`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::alert::OperatorAlert;
use crate::record::{Device, DevicePair, KnownEntity, NoteReference, Record, RecordId, TimelineItem, TypedRecord};
use crate::registry::{RetentionConfig, RetentionSpec, SyncPriorityConfig, SyncPrioritySpec};
use crate::retention::PassReport;
use crate::scheduler::{FailOutcome, SyncBatch, SyncTransport};
use crate::similarity::RankedId;
use crate::store::{Page, QueryRequest};

use super::{EngineError, LoomEngine};

impl LoomEngine {
    // ═══════════════════════════════════════════════════════════════════════
    // Ingestion and reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Store one record, pending sync to every peer.
    ///
    /// Appending the same `(device_id, table, timestamp)` again keeps the
    /// stored id and payload and replaces the metadata.
    pub async fn append(&self, record: TypedRecord) -> Result<RecordId, EngineError> {
        self.ensure_serving("append")?;
        Ok(self.store.append(record).await?)
    }

    /// Store every record or none of them.
    pub async fn append_batch(&self, records: Vec<TypedRecord>) -> Result<Vec<RecordId>, EngineError> {
        self.ensure_serving("append_batch")?;
        Ok(self.store.append_batch(records).await?)
    }

    pub async fn get(&self, id: RecordId) -> Result<Option<Record>, EngineError> {
        self.ensure_serving("get")?;
        Ok(self.store.get(id).await?)
    }

    pub async fn query(&self, request: QueryRequest) -> Result<Page, EngineError> {
        self.ensure_serving("query")?;
        Ok(self.store.query(request).await?)
    }

    pub async fn timeline(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<TimelineItem>, EngineError> {
        self.ensure_serving("timeline")?;
        Ok(self.store.timeline(device_id, since, until).await?)
    }

    /// True while emergency eviction could not get under budget.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Devices and the entity graph
    // ═══════════════════════════════════════════════════════════════════════

    pub fn register_device(&self, device: Device) -> Result<(), EngineError> {
        self.ensure_serving("register_device")?;
        Ok(self.store.register_device(device)?)
    }

    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.store.device(device_id)
    }

    pub async fn put_entity(&self, entity: KnownEntity) -> Result<(), EngineError> {
        self.ensure_serving("put_entity")?;
        Ok(self.store.put_entity(entity).await?)
    }

    pub async fn entity(&self, entity_id: &str) -> Result<Option<KnownEntity>, EngineError> {
        self.ensure_serving("entity")?;
        Ok(self.store.entity(entity_id).await?)
    }

    pub async fn delete_entity(&self, entity_id: &str) -> Result<(), EngineError> {
        self.ensure_serving("delete_entity")?;
        Ok(self.store.delete_entity(entity_id).await?)
    }

    /// Link a note to an entity. Returns false if the link already existed.
    pub async fn add_reference(&self, reference: NoteReference) -> Result<bool, EngineError> {
        self.ensure_serving("add_reference")?;
        Ok(self.store.add_reference(reference).await?)
    }

    pub async fn references_for_note(&self, note_id: &str) -> Result<Vec<NoteReference>, EngineError> {
        self.ensure_serving("references_for_note")?;
        Ok(self.store.references_for_note(note_id).await?)
    }

    /// Ranked live entities similar to `entity_id`, via the attached index.
    pub async fn similar_entities(&self, entity_id: &str, k: usize) -> Result<Vec<RankedId>, EngineError> {
        self.ensure_serving("similar_entities")?;
        let index = self.similarity.as_ref().ok_or(EngineError::NoSimilarityIndex)?;
        Ok(self.store.similar_entities(index.as_ref(), entity_id, k).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Policy configs
    // ═══════════════════════════════════════════════════════════════════════

    pub fn upsert_retention_config(&self, table: &str, spec: RetentionSpec) -> Result<RetentionConfig, EngineError> {
        self.ensure_serving("upsert_retention_config")?;
        Ok(self.registry.upsert_retention(table, spec)?)
    }

    pub fn upsert_sync_priority_config(
        &self,
        table: &str,
        spec: SyncPrioritySpec,
    ) -> Result<SyncPriorityConfig, EngineError> {
        self.ensure_serving("upsert_sync_priority_config")?;
        Ok(self.registry.upsert_sync_priority(table, spec)?)
    }

    /// Run one retention pass now, outside the evaluator's schedule.
    pub async fn run_retention_pass(&self) -> Result<PassReport, EngineError> {
        self.ensure_serving("run_retention_pass")?;
        Ok(self.evaluator.run_pass().await)
    }

    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.alerts.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync protocol
    // ═══════════════════════════════════════════════════════════════════════

    /// Compose the next sync unit for `pair`. Empty when nothing is due.
    pub async fn pull_pending(&self, pair: &DevicePair, max_bytes: usize) -> Result<SyncBatch, EngineError> {
        self.ensure_serving("pull_pending")?;
        Ok(self.scheduler.pull_pending(pair, max_bytes).await?)
    }

    /// Mark a delivered unit synced. Unknown or settled ids return 0.
    pub async fn ack_batch(&self, batch_id: Uuid) -> Result<usize, EngineError> {
        self.ensure_serving("ack_batch")?;
        Ok(self.scheduler.ack_batch(batch_id).await?)
    }

    pub async fn fail_batch(&self, batch_id: Uuid) -> Result<FailOutcome, EngineError> {
        self.ensure_serving("fail_batch")?;
        Ok(self.scheduler.fail_batch(batch_id).await?)
    }

    pub async fn report_failed_terminal(&self, pair: &DevicePair) -> Result<Vec<RecordId>, EngineError> {
        self.ensure_serving("report_failed_terminal")?;
        Ok(self.scheduler.report_failed_terminal(pair).await?)
    }

    /// Give failed-terminal records a fresh set of attempts.
    pub async fn requeue(&self, pair: &DevicePair, ids: &[RecordId]) -> Result<usize, EngineError> {
        self.ensure_serving("requeue")?;
        Ok(self.scheduler.requeue(pair, ids).await?)
    }

    /// Start a delivery worker for `pair` over `transport`.
    pub fn connect(&self, pair: DevicePair, transport: Arc<dyn SyncTransport>) -> Result<(), EngineError> {
        self.ensure_serving("connect")?;
        Ok(self.scheduler.connect(pair, transport)?)
    }

    /// Stop the pair's worker. Its in-flight batch returns to pending.
    pub async fn disconnect(&self, pair: &DevicePair) -> bool {
        self.scheduler.disconnect(pair).await
    }
}
