//! End-to-end tests for the loom engine.
//!
//! Everything runs against the in-memory backend with a manual clock, so
//! retention horizons and backoff deadlines are crossed by advancing time
//! rather than sleeping.
//!
//! # Test Organization
//! - `retention_*` - expiry, downsampling, emergency eviction
//! - `sync_*` - drain order, starvation bound, retry bound
//! - `worker_*` - connected pairs and disconnect

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use loom_store::record::sensor::{GpsFix, HeartRate};
use loom_store::record::{Lineage, Note};
use loom_store::storage::memory::MemoryBackend;
use loom_store::{
    Clock, DevicePair, EngineConfig, LoomEngine, ManualClock, Payload, QueryRequest, RetentionSpec,
    SchedulerError, SharedClock, StatusFilter, SyncBatch, SyncPriority, SyncPrioritySpec, SyncTransport,
    TransportError, TypedRecord,
};

// =============================================================================
// Helpers
// =============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn engine_with(config: EngineConfig) -> (Arc<ManualClock>, LoomEngine) {
    let (_tx, rx) = watch::channel(config.clone());
    let clock = Arc::new(ManualClock::new(t0()));
    let shared: SharedClock = clock.clone();
    let engine = LoomEngine::with_backend(config, rx, Arc::new(MemoryBackend::new()), shared);
    (clock, engine)
}

fn engine() -> (Arc<ManualClock>, LoomEngine) {
    engine_with(EngineConfig { sync_poll_interval_ms: 10, ..Default::default() })
}

fn gps(at: DateTime<Utc>) -> TypedRecord {
    TypedRecord::new("gps", "phone", at, Payload::Gps(GpsFix::new(51.5, -0.12))).unwrap()
}

fn table_record(table: &str, at: DateTime<Utc>) -> TypedRecord {
    let pulse = HeartRate { bpm: 64, confidence: None, rr_intervals: None };
    TypedRecord::new(table, "phone", at, Payload::HeartRate(pulse)).unwrap()
}

fn pair() -> DevicePair {
    DevicePair::new("phone", "laptop")
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
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

struct StalledTransport {
    started: AtomicUsize,
}

#[async_trait]
impl SyncTransport for StalledTransport {
    async fn deliver(&self, _batch: &SyncBatch) -> Result<(), TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn retention_gps_expires_after_two_days() {
    let (clock, engine) = engine();
    engine
        .upsert_retention_config("gps", RetentionSpec { retention_days: Some(1), ..Default::default() })
        .unwrap();
    let id = engine.append(gps(t0())).await.unwrap();

    clock.advance(chrono::Duration::days(2));
    let report = engine.run_retention_pass().await.unwrap();

    assert_eq!(report.counts("gps").unwrap().expired, 1);
    assert!(engine.get(id).await.unwrap().is_none());
    let page = engine.query(QueryRequest::table("gps")).await.unwrap();
    assert!(page.records.is_empty());
}

#[tokio::test]
async fn retention_week_old_window_is_halved() {
    let (clock, engine) = engine();
    let week_ago = t0();
    let records = (0..10)
        .map(|i| table_record("heart_rate", week_ago + chrono::Duration::minutes(i)))
        .collect();
    let originals = engine.append_batch(records).await.unwrap();
    engine
        .upsert_retention_config(
            "heart_rate",
            RetentionSpec { downsample_after_days: Some(7), downsample_ratio: Some(0.5), ..Default::default() },
        )
        .unwrap();

    clock.advance(chrono::Duration::days(8));
    // Younger than the horizon, left alone
    let fresh = engine.append(table_record("heart_rate", clock.now())).await.unwrap();

    let report = engine.run_retention_pass().await.unwrap();
    assert_eq!(report.counts("heart_rate").unwrap().derived_written, 5);

    let page = engine.query(QueryRequest::table("heart_rate").status(StatusFilter::Downsampled)).await.unwrap();
    assert_eq!(page.records.len(), 5);
    assert!(page
        .records
        .iter()
        .all(|r| matches!(r.lineage, Lineage::Downsampled { source_count: 2, .. })));
    for id in originals {
        assert!(engine.get(id).await.unwrap().is_none());
    }
    let fresh = engine.get(fresh).await.unwrap().unwrap();
    assert_eq!(fresh.lineage, Lineage::Raw);

    // Nothing left to reduce
    assert_eq!(engine.run_retention_pass().await.unwrap().changes(), 0);
}

#[tokio::test]
async fn retention_over_budget_evicts_background_then_oldest_critical() {
    let (_clock, engine) = engine();
    let big = "n".repeat(64 * 1024);
    let notes = (0..20)
        .map(|i| {
            let note = Note::new(format!("note-{i}"), "user-1", big.clone());
            TypedRecord::new("notes", "phone", t0() + chrono::Duration::seconds(i), Payload::Note(note)).unwrap()
        })
        .collect();
    engine.append_batch(notes).await.unwrap();
    for i in 0..5 {
        engine.append(gps(t0() + chrono::Duration::seconds(i))).await.unwrap();
    }
    engine
        .upsert_sync_priority_config("notes", SyncPrioritySpec::new(SyncPriority::Critical))
        .unwrap();
    engine
        .upsert_retention_config("notes", RetentionSpec { min_required_space_mb: Some(1), ..Default::default() })
        .unwrap();

    let report = engine.run_retention_pass().await.unwrap();
    assert!(!report.storage_exhausted());
    assert!(!engine.is_degraded());
    let eviction = report.eviction.unwrap();
    assert!(eviction.footprint_after <= eviction.budget_bytes);

    // Tables without a sync config count as BACKGROUND and go first
    assert!(engine.query(QueryRequest::table("gps")).await.unwrap().records.is_empty());
    let notes = engine.query(QueryRequest::table("notes")).await.unwrap().records;
    assert!(!notes.is_empty() && notes.len() < 20);
    assert_eq!(notes[0].timestamp, t0() + chrono::Duration::seconds(20 - notes.len() as i64));
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn sync_drains_critical_then_high_then_low() {
    let (clock, engine) = engine();
    for (table, priority) in [("vitals", SyncPriority::Critical), ("steps", SyncPriority::High), ("ambient", SyncPriority::Low)] {
        engine.upsert_sync_priority_config(table, SyncPrioritySpec::new(priority)).unwrap();
    }

    // Ingested lowest tier first
    let mut expected = Vec::new();
    for table in ["ambient", "steps", "vitals"] {
        let first = engine.append(table_record(table, t0())).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let second = engine.append(table_record(table, t0() + chrono::Duration::seconds(1))).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        expected.push((first, second));
    }

    let batch = engine.pull_pending(&pair(), 1 << 20).await.unwrap();
    let (a1, a2) = expected[0];
    let (s1, s2) = expected[1];
    let (v1, v2) = expected[2];
    assert_eq!(batch.record_ids(), vec![v1, v2, s1, s2, a1, a2]);
    assert_eq!(batch.tables[0].priority, SyncPriority::Critical);
}

#[tokio::test]
async fn sync_overdue_low_record_goes_before_newer_high() {
    let (clock, engine) = engine();
    let mut low = SyncPrioritySpec::new(SyncPriority::Low);
    low.max_delay_seconds = Some(60);
    engine.upsert_sync_priority_config("ambient", low).unwrap();
    engine
        .upsert_sync_priority_config("steps", SyncPrioritySpec::new(SyncPriority::High))
        .unwrap();

    let old_low = engine.append(table_record("ambient", t0())).await.unwrap();
    clock.advance(chrono::Duration::seconds(120));
    let new_high = engine.append(table_record("steps", clock.now())).await.unwrap();

    let batch = engine.pull_pending(&pair(), 1 << 20).await.unwrap();
    assert_eq!(batch.record_ids(), vec![old_low, new_high]);
}

#[tokio::test]
async fn sync_retry_bound_stops_at_retry_count() {
    let (clock, engine) = engine();
    let mut spec = SyncPrioritySpec::new(SyncPriority::High);
    spec.retry_count = 3;
    engine.upsert_sync_priority_config("gps", spec).unwrap();
    let id = engine.append(gps(t0())).await.unwrap();

    for attempt in 1..=3 {
        let batch = engine.pull_pending(&pair(), 1 << 20).await.unwrap();
        assert_eq!(batch.record_ids(), vec![id], "attempt {attempt}");
        let outcome = engine.fail_batch(batch.batch_id).await.unwrap();
        if attempt < 3 {
            assert_eq!(outcome.retrying, vec![id]);
            assert!(outcome.exhausted.is_none());
        } else {
            assert!(outcome.retrying.is_empty());
            assert!(matches!(outcome.exhausted, Some(SchedulerError::RetryExhausted { .. })));
        }
        clock.advance(chrono::Duration::minutes(10));
    }

    // No fourth attempt
    assert!(engine.pull_pending(&pair(), 1 << 20).await.unwrap().is_empty());
    assert_eq!(engine.report_failed_terminal(&pair()).await.unwrap(), vec![id]);
    let failed = engine
        .query(QueryRequest::table("gps").status(StatusFilter::FailedTerminal(pair())))
        .await
        .unwrap();
    assert_eq!(failed.records.len(), 1);

    // Requeue grants fresh attempts
    assert_eq!(engine.requeue(&pair(), &[id]).await.unwrap(), 1);
    let batch = engine.pull_pending(&pair(), 1 << 20).await.unwrap();
    assert_eq!(batch.record_ids(), vec![id]);
    assert_eq!(engine.ack_batch(batch.batch_id).await.unwrap(), 1);
}

#[tokio::test]
async fn sync_acknowledged_records_leave_pending() {
    let (_clock, engine) = engine();
    let ids = engine
        .append_batch(vec![gps(t0()), gps(t0() + chrono::Duration::seconds(1))])
        .await
        .unwrap();

    let batch = engine.pull_pending(&pair(), 1 << 20).await.unwrap();
    assert_eq!(batch.record_ids(), ids);
    assert!(matches!(
        engine.pull_pending(&pair(), 1 << 20).await,
        Err(loom_store::EngineError::Scheduler(SchedulerError::BatchInFlight { .. }))
    ));
    assert_eq!(engine.ack_batch(batch.batch_id).await.unwrap(), 2);
    assert_eq!(engine.ack_batch(batch.batch_id).await.unwrap(), 0);

    let synced = engine
        .query(QueryRequest::table("gps").status(StatusFilter::Synced(pair())))
        .await
        .unwrap();
    assert_eq!(synced.records.len(), 2);

    // Another peer still sees both as pending
    let other = DevicePair::new("phone", "tablet");
    assert_eq!(engine.pull_pending(&other, 1 << 20).await.unwrap().len(), 2);
}

// =============================================================================
// Workers
// =============================================================================

#[tokio::test]
async fn worker_delivers_and_marks_synced() {
    let (_clock, engine) = engine();
    engine.start().unwrap();
    let id = engine.append(gps(t0())).await.unwrap();

    let transport = Arc::new(CountingTransport { delivered: AtomicUsize::new(0) });
    engine.connect(pair(), transport.clone()).unwrap();
    wait_for(|| transport.delivered.load(Ordering::SeqCst) == 1).await;

    // The ack lands just after delivery returns
    for _ in 0..300 {
        if engine.get(id).await.unwrap().unwrap().synced_to.contains(&pair()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pending = engine
        .query(QueryRequest::table("gps").status(StatusFilter::PendingSync(pair())))
        .await
        .unwrap();
    assert!(pending.records.is_empty());

    engine.shutdown().await;
    assert!(engine.scheduler().connected_pairs().is_empty());
}

#[tokio::test]
async fn worker_disconnect_keeps_in_flight_records_pending() {
    let (_clock, engine) = engine();
    let id = engine.append(gps(t0())).await.unwrap();

    let stalled = Arc::new(StalledTransport { started: AtomicUsize::new(0) });
    engine.connect(pair(), stalled.clone()).unwrap();
    wait_for(|| stalled.started.load(Ordering::SeqCst) == 1).await;
    assert!(engine.scheduler().in_flight(&pair()).is_some());

    assert!(engine.disconnect(&pair()).await);
    assert!(engine.scheduler().in_flight(&pair()).is_none());
    let record = engine.get(id).await.unwrap().unwrap();
    assert!(record.is_pending_for(&pair()));

    // Reconnecting delivers it without an attempt having been counted
    let transport = Arc::new(CountingTransport { delivered: AtomicUsize::new(0) });
    engine.connect(pair(), transport.clone()).unwrap();
    wait_for(|| transport.delivered.load(Ordering::SeqCst) == 1).await;
    assert!(engine.disconnect(&pair()).await);
    assert!(engine.report_failed_terminal(&pair()).await.unwrap().is_empty());
}
