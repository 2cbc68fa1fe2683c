// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-ordered sync scheduler.
//!
//! Every directed device pair has its own [`PairQueue`] and at most one
//! batch in flight. A sync unit is composed from the queue, handed to the
//! caller (or a connected worker's transport), and settled with
//! [`SyncScheduler::ack_batch`] or [`SyncScheduler::fail_batch`].
//!
//! # Record lifecycle for one pair
//!
//! ```text
//!   pending ──pull──► in flight ──ack──► synced
//!      ▲                  │
//!      │               fail / disconnect
//!      │                  │
//!      ├── backoff ◄──────┤ attempts < retry_count
//!      │                  │
//!   requeue          failed-terminal (attempts == retry_count)
//!      └──────────────────┘
//! ```
//!
//! Queue state is rebuilt from the store on every pull, so nothing here
//! needs to be persisted: a restart loses backoff timers and attempt
//! counts for in-progress retries, never records.

pub mod batch;
pub mod queue;
pub mod retry;
pub mod transport;
mod worker;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{AlertSink, OperatorAlert};
use crate::config::EngineConfig;
use crate::metrics;
use crate::record::{DevicePair, RecordId};
use crate::registry::{ConfigRegistry, RegistrySnapshot};
use crate::resilience::retry::BackoffPolicy;
use crate::store::{RecordStore, StoreError};

pub use batch::{SyncBatch, TableBatch};
pub use queue::{PairQueue, QueueEntry};
pub use retry::{RetryDecision, RetryState};
pub use transport::{SyncTransport, TransportError};

use self::worker::WorkerHandle;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("pair {pair} already has batch {batch_id} in flight")]
    BatchInFlight { pair: DevicePair, batch_id: Uuid },

    #[error("unknown batch {0}")]
    UnknownBatch(Uuid),

    #[error("{} records exhausted their retries for {pair}", .record_ids.len())]
    RetryExhausted { pair: DevicePair, record_ids: Vec<RecordId> },

    #[error("pair {0} is already connected")]
    AlreadyConnected(DevicePair),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of reporting a failed delivery.
#[derive(Debug)]
pub struct FailOutcome {
    /// Re-queued with backoff
    pub retrying: Vec<RecordId>,
    /// `SchedulerError::RetryExhausted` for records that are now failed-terminal
    pub exhausted: Option<SchedulerError>,
}

impl FailOutcome {
    #[must_use]
    pub fn exhausted_ids(&self) -> &[RecordId] {
        match &self.exhausted {
            Some(SchedulerError::RetryExhausted { record_ids, .. }) => record_ids,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub queue_capacity: usize,
    pub max_bytes: usize,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_bytes: config.sync_max_bytes,
            poll_interval: config.sync_poll_interval(),
            backoff: BackoffPolicy::new(config.retry_base_delay(), config.max_backoff()),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

#[derive(Debug)]
struct InFlight {
    batch_id: Uuid,
    entries: Vec<QueueEntry>,
}

#[derive(Debug)]
struct PairState {
    queue: PairQueue,
    in_flight: Option<InFlight>,
    /// Exhausted records whose failed-terminal mark is not yet persisted.
    /// Never re-queued; the mark is retried on the next refill.
    unmarked_terminal: BTreeMap<RecordId, String>,
}

impl PairState {
    fn in_flight_id(&self) -> Option<Uuid> {
        self.in_flight.as_ref().map(|f| f.batch_id)
    }

    fn take_in_flight(&mut self, batch_id: Uuid) -> Vec<QueueEntry> {
        match self.in_flight.take() {
            Some(f) if f.batch_id == batch_id => f.entries,
            other => {
                self.in_flight = other;
                Vec::new()
            }
        }
    }

    fn restore(&mut self, entries: Vec<QueueEntry>) {
        for entry in entries {
            self.queue.push(entry);
        }
    }
}

pub struct SyncScheduler {
    store: Arc<RecordStore>,
    registry: Arc<ConfigRegistry>,
    alerts: AlertSink,
    settings: SchedulerSettings,
    pairs: DashMap<DevicePair, Arc<Mutex<PairState>>>,
    /// Batch id -> owning pair, for batches in flight
    batches: DashMap<Uuid, DevicePair>,
    workers: DashMap<DevicePair, WorkerHandle>,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<RecordStore>,
        registry: Arc<ConfigRegistry>,
        alerts: AlertSink,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            registry,
            alerts,
            settings,
            pairs: DashMap::new(),
            batches: DashMap::new(),
            workers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn pair_state(&self, pair: &DevicePair) -> Arc<Mutex<PairState>> {
        self.pairs
            .entry(pair.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PairState {
                    queue: PairQueue::new(self.settings.queue_capacity),
                    in_flight: None,
                    unmarked_terminal: BTreeMap::new(),
                }))
            })
            .clone()
    }

    /// Records currently queued for `pair`, excluding the batch in flight.
    #[must_use]
    pub fn queue_depth(&self, pair: &DevicePair) -> usize {
        self.pairs.get(pair).map_or(0, |s| s.lock().queue.len())
    }

    #[must_use]
    pub fn in_flight(&self, pair: &DevicePair) -> Option<Uuid> {
        self.pairs.get(pair).and_then(|s| s.lock().in_flight_id())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Unit composition
    // ═══════════════════════════════════════════════════════════════════════

    /// Compose the next sync unit for `pair`.
    ///
    /// Returns an empty batch when nothing is due. A non-empty batch stays
    /// in flight until it is acknowledged, failed or released.
    #[tracing::instrument(skip(self), fields(pair = %pair))]
    pub async fn pull_pending(&self, pair: &DevicePair, max_bytes: usize) -> Result<SyncBatch, SchedulerError> {
        let state = self.pair_state(pair);
        let outstanding = state.lock().in_flight_id();
        if let Some(batch_id) = outstanding {
            return Err(SchedulerError::BatchInFlight { pair: pair.clone(), batch_id });
        }

        let snapshot = self.registry.snapshot();
        self.refill(pair, &state, &snapshot).await?;

        let now = self.store.clock().now();
        let batch_id = Uuid::new_v4();
        let selected = {
            let mut s = state.lock();
            if let Some(batch_id) = s.in_flight_id() {
                return Err(SchedulerError::BatchInFlight { pair: pair.clone(), batch_id });
            }
            let selected = s.queue.select(now, max_bytes, |table| snapshot.sync_policy(table));
            if selected.is_empty() {
                return Ok(SyncBatch::new(batch_id, pair.clone(), now));
            }
            // Claim the slot before awaiting the store
            s.in_flight = Some(InFlight { batch_id, entries: selected.clone() });
            selected
        };

        let mut batch = SyncBatch::new(batch_id, pair.clone(), now);
        let mut kept = Vec::with_capacity(selected.len());
        let mut stale = Vec::new();
        for entry in selected {
            let loaded = match self.store.get(entry.id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    let mut s = state.lock();
                    let claimed = s.take_in_flight(batch_id);
                    s.restore(claimed);
                    return Err(e.into());
                }
            };
            match loaded {
                Some(record) if record.is_pending_for(pair) => {
                    batch.push(record, entry.priority);
                    kept.push(entry);
                }
                _ => stale.push(entry.id),
            }
        }

        {
            let mut s = state.lock();
            for id in stale {
                s.queue.forget(id);
            }
            if kept.is_empty() {
                s.in_flight = None;
            } else {
                s.in_flight = Some(InFlight { batch_id, entries: kept });
                self.batches.insert(batch_id, pair.clone());
            }
            metrics::set_queue_depth(&pair.to_string(), s.queue.len());
        }

        if !batch.is_empty() {
            metrics::record_sync_batch(batch.len(), batch.total_bytes);
            debug!(
                batch_id = %batch_id,
                records = batch.len(),
                tables = batch.tables.len(),
                bytes = batch.total_bytes,
                "Sync unit composed"
            );
        }
        Ok(batch)
    }

    /// Pull the source device's pending records into the queue.
    async fn refill(
        &self,
        pair: &DevicePair,
        state: &Mutex<PairState>,
        snapshot: &RegistrySnapshot,
    ) -> Result<(), SchedulerError> {
        let parked: Vec<(RecordId, String)> = {
            let s = state.lock();
            s.unmarked_terminal.iter().map(|(id, table)| (*id, table.clone())).collect()
        };
        if !parked.is_empty() {
            let (ids, tables): (Vec<RecordId>, Vec<String>) = parked.into_iter().unzip();
            // Still parked on failure, so skipped below
            let _ = self.persist_terminal(pair, state, &ids, &tables).await;
        }

        let capacity = self.settings.queue_capacity;
        let mut found = Vec::new();
        for key in self.store.device_streams(&pair.source).await? {
            let priority = snapshot.sync_policy(&key.table).priority;
            for record in self.store.pending_for_pair(pair, &key.table, capacity).await? {
                found.push(QueueEntry::of(&record, priority));
            }
        }

        let mut s = state.lock();
        let in_flight: HashSet<RecordId> = s
            .in_flight
            .as_ref()
            .map(|f| f.entries.iter().map(|e| e.id).collect())
            .unwrap_or_default();
        for entry in found {
            if in_flight.contains(&entry.id) || s.unmarked_terminal.contains_key(&entry.id) {
                continue;
            }
            // Re-keyed so a tier change takes effect
            s.queue.remove(entry.id);
            s.queue.push(entry);
        }
        let dropped = s.queue.shed();
        if dropped > 0 {
            debug!(pair = %pair, dropped, capacity, "Queue over capacity, newest low-tier entries dropped");
            metrics::record_queue_dropped(&pair.to_string(), dropped);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outcomes
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark every record of the batch synced for its pair.
    ///
    /// Returns how many records were newly marked. Acknowledging a batch
    /// that is no longer in flight is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn ack_batch(&self, batch_id: Uuid) -> Result<usize, SchedulerError> {
        let Some((_, pair)) = self.batches.remove(&batch_id) else {
            debug!(%batch_id, "Ack for a batch that is not in flight");
            return Ok(0);
        };
        let state = self.pair_state(&pair);
        let entries = state.lock().take_in_flight(batch_id);
        let ids: Vec<RecordId> = entries.iter().map(|e| e.id).collect();

        let marked = match self.store.mark_synced(&ids, &pair).await {
            Ok(marked) => marked,
            Err(e) => {
                state.lock().restore(entries);
                return Err(e.into());
            }
        };
        {
            let mut s = state.lock();
            for id in &ids {
                s.queue.forget(*id);
            }
        }

        self.store.touch_device(&pair.target, self.store.clock().now());
        metrics::record_sync_outcome("acked", ids.len());
        info!(pair = %pair, %batch_id, records = ids.len(), newly_synced = marked, "Sync batch acknowledged");
        Ok(marked)
    }

    /// Count a failed delivery against every record of the batch.
    #[tracing::instrument(skip(self))]
    pub async fn fail_batch(&self, batch_id: Uuid) -> Result<FailOutcome, SchedulerError> {
        let Some((_, pair)) = self.batches.remove(&batch_id) else {
            return Err(SchedulerError::UnknownBatch(batch_id));
        };
        let state = self.pair_state(&pair);
        let snapshot = self.registry.snapshot();
        let now = self.store.clock().now();

        let mut retrying = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut s = state.lock();
            for entry in s.take_in_flight(batch_id) {
                let policy = snapshot.sync_policy(&entry.table);
                let previous = s.queue.attempts(entry.id);
                match retry::after_failure(&self.settings.backoff, &policy, previous, now) {
                    RetryDecision::Retry(next) => {
                        s.queue.set_retry(entry.id, next);
                        retrying.push(entry.id);
                        s.queue.push(entry);
                    }
                    RetryDecision::Exhausted { .. } => {
                        s.queue.remove(entry.id);
                        s.unmarked_terminal.insert(entry.id, entry.table.clone());
                        exhausted.push(entry);
                    }
                }
            }
        }
        metrics::record_sync_outcome("failed", retrying.len() + exhausted.len());

        if exhausted.is_empty() {
            return Ok(FailOutcome { retrying, exhausted: None });
        }

        let record_ids: Vec<RecordId> = exhausted.iter().map(|e| e.id).collect();
        let tables: Vec<String> = exhausted.into_iter().map(|e| e.table).collect();
        self.persist_terminal(&pair, &state, &record_ids, &tables).await?;

        Ok(FailOutcome {
            retrying,
            exhausted: Some(SchedulerError::RetryExhausted { pair, record_ids }),
        })
    }

    /// Store the failed-terminal mark, then drop the records' retry state.
    /// On a store error they stay parked in `unmarked_terminal`.
    async fn persist_terminal(
        &self,
        pair: &DevicePair,
        state: &Mutex<PairState>,
        record_ids: &[RecordId],
        tables: &[String],
    ) -> Result<(), SchedulerError> {
        if let Err(e) = self.store.mark_failed_terminal(record_ids, pair).await {
            warn!(pair = %pair, records = record_ids.len(), error = %e, "Could not persist failed-terminal marks");
            return Err(e.into());
        }
        {
            let mut s = state.lock();
            for id in record_ids {
                s.unmarked_terminal.remove(id);
                s.queue.forget(*id);
            }
        }

        let mut per_table: BTreeMap<&str, usize> = BTreeMap::new();
        for table in tables {
            *per_table.entry(table.as_str()).or_default() += 1;
        }
        for (table, count) in per_table {
            metrics::record_retry_exhausted(table, count);
        }
        warn!(pair = %pair, records = record_ids.len(), "Records exhausted their retries");
        self.alerts.send(OperatorAlert::SyncRetryExhausted {
            pair: pair.clone(),
            record_ids: record_ids.to_vec(),
        });
        Ok(())
    }

    /// Records that gave up syncing to `pair`, oldest first.
    pub async fn report_failed_terminal(&self, pair: &DevicePair) -> Result<Vec<RecordId>, SchedulerError> {
        Ok(self.store.failed_terminal_for_pair(pair).await?)
    }

    /// Make failed-terminal records pending again with a fresh retry
    /// budget. Returns how many were re-queued.
    pub async fn requeue(&self, pair: &DevicePair, ids: &[RecordId]) -> Result<usize, SchedulerError> {
        let cleared = self.store.clear_failed_terminal(ids, pair).await?;
        let state = self.pair_state(pair);
        let mut s = state.lock();
        for id in ids {
            s.unmarked_terminal.remove(id);
            s.queue.forget(*id);
        }
        info!(pair = %pair, records = cleared, "Failed records re-queued");
        Ok(cleared)
    }

    /// Put the in-flight batch back in the queue without counting an
    /// attempt. Returns how many records were released.
    pub fn release(&self, pair: &DevicePair) -> usize {
        let Some(state) = self.pairs.get(pair).map(|s| s.value().clone()) else {
            return 0;
        };
        let mut s = state.lock();
        let Some(in_flight) = s.in_flight.take() else {
            return 0;
        };
        self.batches.remove(&in_flight.batch_id);
        let released = in_flight.entries.len();
        s.restore(in_flight.entries);
        released
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Workers
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a delivery worker for `pair`.
    pub fn connect(self: &Arc<Self>, pair: DevicePair, transport: Arc<dyn SyncTransport>) -> Result<(), SchedulerError> {
        match self.workers.entry(pair.clone()) {
            Entry::Occupied(_) => return Err(SchedulerError::AlreadyConnected(pair)),
            Entry::Vacant(slot) => {
                let (shutdown, rx) = watch::channel(false);
                let task = tokio::spawn(worker::run(self.clone(), pair.clone(), transport, rx));
                slot.insert(WorkerHandle { shutdown, task });
            }
        }
        metrics::set_sync_workers(self.workers.len());
        info!(pair = %pair, "Pair connected");
        Ok(())
    }

    /// Stop the pair's worker and release its in-flight batch.
    ///
    /// Returns false when the pair was not connected.
    pub async fn disconnect(&self, pair: &DevicePair) -> bool {
        let Some((_, handle)) = self.workers.remove(pair) else {
            return false;
        };
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            warn!(pair = %pair, error = %e, "Sync worker ended abnormally");
        }
        let released = self.release(pair);
        metrics::set_sync_workers(self.workers.len());
        info!(pair = %pair, released, "Pair disconnected");
        true
    }

    #[must_use]
    pub fn connected_pairs(&self) -> Vec<DevicePair> {
        let mut pairs: Vec<DevicePair> = self.workers.iter().map(|w| w.key().clone()).collect();
        pairs.sort();
        pairs
    }

    /// Disconnect every pair.
    pub async fn shutdown(&self) {
        for pair in self.connected_pairs() {
            self.disconnect(&pair).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::record::sensor::GpsFix;
    use crate::record::{Device, Payload, TypedRecord};
    use crate::registry::{SyncDefaults, SyncPriority, SyncPrioritySpec};
    use crate::storage::memory::MemoryBackend;
    use crate::storage::testing::FlakyBackend;
    use crate::storage::traits::RecordBackend;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
    }

    fn pair() -> DevicePair {
        DevicePair::new("phone", "laptop")
    }

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<RecordStore>,
        registry: Arc<ConfigRegistry>,
        scheduler: Arc<SyncScheduler>,
    }

    fn harness(settings: SchedulerSettings) -> Harness {
        harness_on(Arc::new(MemoryBackend::new()), settings)
    }

    fn harness_on(backend: Arc<dyn RecordBackend>, settings: SchedulerSettings) -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let shared: SharedClock = clock.clone();
        let store = Arc::new(RecordStore::new(backend).with_clock(shared.clone()));
        let registry = Arc::new(ConfigRegistry::new(shared, SyncDefaults::default()));
        let scheduler = Arc::new(SyncScheduler::new(store.clone(), registry.clone(), AlertSink::new(8), settings));
        Harness { clock, store, registry, scheduler }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            queue_capacity: 100,
            max_bytes: usize::MAX,
            poll_interval: Duration::from_millis(5),
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }

    async fn append(h: &Harness, table: &str, secs: i64) -> RecordId {
        let record = TypedRecord::new(
            table,
            "phone",
            t0() + chrono::Duration::seconds(secs),
            Payload::Gps(GpsFix::new(10.0, 20.0)),
        )
        .unwrap();
        h.store.append(record).await.unwrap()
    }

    fn tiers(h: &Harness) {
        for (table, priority) in [
            ("vitals", SyncPriority::Critical),
            ("messages", SyncPriority::High),
            ("logs", SyncPriority::Low),
        ] {
            h.registry.upsert_sync_priority(table, SyncPrioritySpec::new(priority)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_drains_in_tier_order_fifo_within_tier() {
        let h = harness(settings());
        tiers(&h);
        let log = append(&h, "logs", 0).await;
        let msg_a = append(&h, "messages", 1).await;
        let vital = append(&h, "vitals", 2).await;
        let msg_b = append(&h, "messages", 3).await;

        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![vital, msg_a, msg_b, log]);
        assert_eq!(batch.tables.len(), 3);
    }

    #[tokio::test]
    async fn test_overdue_low_record_jumps_ahead() {
        let h = harness(settings());
        tiers(&h);
        let mut spec = SyncPrioritySpec::new(SyncPriority::Low);
        spec.max_delay_seconds = Some(60);
        h.registry.upsert_sync_priority("logs", spec).unwrap();

        let log = append(&h, "logs", 0).await;
        h.clock.advance(chrono::Duration::seconds(120));
        let msg = append(&h, "messages", 1).await;

        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![log, msg]);
    }

    #[tokio::test]
    async fn test_one_batch_in_flight_and_idempotent_ack() {
        let h = harness(settings());
        let id = append(&h, "gps", 0).await;
        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![id]);

        let err = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap_err();
        assert!(matches!(err, SchedulerError::BatchInFlight { batch_id, .. } if batch_id == batch.batch_id));

        assert_eq!(h.scheduler.ack_batch(batch.batch_id).await.unwrap(), 1);
        assert_eq!(h.scheduler.ack_batch(batch.batch_id).await.unwrap(), 0);
        assert!(h.store.get(id).await.unwrap().unwrap().synced_to.contains(&pair()));
        assert!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_touches_target_device() {
        let h = harness(settings());
        h.store.register_device(Device::new("laptop", "user", t0())).unwrap();
        append(&h, "gps", 0).await;
        h.clock.advance(chrono::Duration::minutes(5));

        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        h.scheduler.ack_batch(batch.batch_id).await.unwrap();
        assert_eq!(h.store.device("laptop").unwrap().last_seen, t0() + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_retry_bound_then_requeue() {
        let h = harness(settings());
        let id = append(&h, "gps", 0).await;

        for attempt in 1..=3u32 {
            let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
            assert_eq!(batch.record_ids(), vec![id], "attempt {attempt}");
            let outcome = h.scheduler.fail_batch(batch.batch_id).await.unwrap();
            if attempt < 3 {
                assert_eq!(outcome.retrying, vec![id]);
                // Not due until the backoff passes
                assert!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().is_empty());
                h.clock.advance(chrono::Duration::seconds(60));
            } else {
                assert!(outcome.retrying.is_empty());
                assert_eq!(outcome.exhausted_ids(), &[id]);
            }
        }

        // No fourth attempt, however long we wait
        h.clock.advance(chrono::Duration::days(1));
        assert!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().is_empty());
        assert_eq!(h.scheduler.report_failed_terminal(&pair()).await.unwrap(), vec![id]);

        assert_eq!(h.scheduler.requeue(&pair(), &[id]).await.unwrap(), 1);
        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![id]);
        let outcome = h.scheduler.fail_batch(batch.batch_id).await.unwrap();
        assert_eq!(outcome.retrying, vec![id], "requeue grants a fresh budget");
    }

    #[tokio::test]
    async fn test_exhausted_record_is_not_retried_when_mark_write_fails() {
        let backend = Arc::new(FlakyBackend::new());
        let h = harness_on(backend.clone(), settings());
        let id = append(&h, "gps", 0).await;

        for _ in 1..3u32 {
            let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
            assert_eq!(h.scheduler.fail_batch(batch.batch_id).await.unwrap().retrying, vec![id]);
            h.clock.advance(chrono::Duration::seconds(60));
        }

        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![id]);
        backend.fail_batches(true);
        let err = h.scheduler.fail_batch(batch.batch_id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Store(_)), "got {err:?}");

        // Mark still missing, but the budget is spent
        h.clock.advance(chrono::Duration::days(1));
        assert!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().is_empty());
        assert!(h.scheduler.report_failed_terminal(&pair()).await.unwrap().is_empty());

        backend.fail_batches(false);
        assert!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().is_empty());
        assert_eq!(h.scheduler.report_failed_terminal(&pair()).await.unwrap(), vec![id]);
        assert_eq!(h.scheduler.queue_depth(&pair()), 0);
    }

    #[tokio::test]
    async fn test_backoff_doubles_between_attempts() {
        let h = harness(settings());
        let id = append(&h, "gps", 0).await;
        let mut spec = SyncPrioritySpec::new(SyncPriority::High);
        spec.retry_count = 10;
        h.registry.upsert_sync_priority("gps", spec).unwrap();

        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        h.scheduler.fail_batch(batch.batch_id).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![id]);

        h.scheduler.fail_batch(batch.batch_id).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        assert!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().is_empty());
        h.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap().record_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_capacity_sheds_and_refills_lazily() {
        let mut s = settings();
        s.queue_capacity = 2;
        let h = harness(s);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(append(&h, "logs", i).await);
        }

        let mut delivered = Vec::new();
        loop {
            let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() <= 2);
            delivered.extend(batch.record_ids());
            h.scheduler.ack_batch(batch.batch_id).await.unwrap();
        }
        assert_eq!(delivered, ids);
    }

    #[tokio::test]
    async fn test_table_batch_size_is_respected() {
        let h = harness(settings());
        let mut spec = SyncPrioritySpec::new(SyncPriority::High);
        spec.batch_size = 2;
        h.registry.upsert_sync_priority("messages", spec).unwrap();
        for i in 0..3 {
            append(&h, "messages", i).await;
        }
        append(&h, "logs", 10).await;

        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.table("messages").unwrap().record_ids.len(), 2);
        assert_eq!(batch.table("logs").unwrap().record_ids.len(), 1);
        assert_eq!(h.scheduler.queue_depth(&pair()), 1);
    }

    struct CountingTransport {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for CountingTransport {
        async fn deliver(&self, batch: &SyncBatch) -> Result<(), TransportError> {
            self.delivered.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl SyncTransport for StalledTransport {
        async fn deliver(&self, _batch: &SyncBatch) -> Result<(), TransportError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_worker_delivers_and_acks() {
        let h = harness(settings());
        for i in 0..3 {
            append(&h, "gps", i).await;
        }
        let transport = Arc::new(CountingTransport { delivered: AtomicUsize::new(0) });
        h.scheduler.connect(pair(), transport.clone()).unwrap();
        assert!(matches!(
            h.scheduler.connect(pair(), transport.clone()),
            Err(SchedulerError::AlreadyConnected(_))
        ));

        wait_for(|| transport.delivered.load(Ordering::SeqCst) == 3).await;
        assert!(h.scheduler.disconnect(&pair()).await);
        assert!(!h.scheduler.disconnect(&pair()).await);

        let pending = h.store.pending_for_pair(&pair(), "gps", 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_in_flight_without_attempt() {
        let h = harness(settings());
        let id = append(&h, "gps", 0).await;
        h.scheduler.connect(pair(), Arc::new(StalledTransport)).unwrap();

        let scheduler = h.scheduler.clone();
        wait_for(move || scheduler.in_flight(&pair()).is_some()).await;
        assert!(h.scheduler.disconnect(&pair()).await);

        assert!(h.scheduler.in_flight(&pair()).is_none());
        assert_eq!(h.scheduler.queue_depth(&pair()), 1);
        assert!(h.store.get(id).await.unwrap().unwrap().is_pending_for(&pair()));

        // Still a full retry budget: the first failure retries
        let batch = h.scheduler.pull_pending(&pair(), usize::MAX).await.unwrap();
        assert_eq!(batch.record_ids(), vec![id]);
        let outcome = h.scheduler.fail_batch(batch.batch_id).await.unwrap();
        assert_eq!(outcome.retrying, vec![id]);
    }
}
