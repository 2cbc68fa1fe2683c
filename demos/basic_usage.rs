// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic loom-store usage.
//!
//! Demonstrates:
//! 1. Opening an in-memory engine
//! 2. Declaring retention and sync priority configs
//! 3. Appending sensor records and a note
//! 4. Running a retention pass
//! 5. Draining a device pair by hand, then through a connected worker
//! 6. Displaying captured metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::sync::watch;

use loom_store::record::sensor::{GpsFix, HeartRate};
use loom_store::record::Note;
use loom_store::{
    CompressionAlgorithm, DevicePair, EngineConfig, LoomEngine, Payload, RetentionSpec, SyncBatch, SyncPriority,
    SyncPrioritySpec, SyncTransport, TransportError, TypedRecord,
};

/// Prints every unit instead of sending it anywhere.
struct PrintTransport;

#[async_trait]
impl SyncTransport for PrintTransport {
    async fn deliver(&self, batch: &SyncBatch) -> Result<(), TransportError> {
        for table in &batch.tables {
            println!(
                "   📡 {} → {}: {} {} record(s) [{}]",
                batch.pair.source,
                batch.pair.target,
                table.record_ids.len(),
                table.table,
                table.priority
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             loom-store: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Opening loom engine (in-memory)...");
    let config = EngineConfig {
        sync_poll_interval_ms: 50,
        ..Default::default()
    };
    let (_config_tx, config_rx) = watch::channel(config.clone());
    let engine = LoomEngine::open(config, config_rx).await?;
    engine.start()?;
    println!("   ✓ Engine state: {}\n", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Declare policies
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Declaring policies...");
    engine.upsert_sync_priority_config("heart_rate", SyncPrioritySpec::new(SyncPriority::Critical))?;
    engine.upsert_sync_priority_config("gps", SyncPrioritySpec::new(SyncPriority::High))?;
    let mut notes = SyncPrioritySpec::new(SyncPriority::Low);
    notes.max_delay_seconds = Some(3600);
    engine.upsert_sync_priority_config("notes", notes)?;
    engine.upsert_retention_config(
        "gps",
        RetentionSpec {
            retention_days: Some(30),
            compression_enabled: true,
            compression_algorithm: CompressionAlgorithm::Zstd,
            compress_after_days: Some(1),
            ..Default::default()
        },
    )?;
    println!("   ✓ 3 sync priority configs, 1 retention config\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Append records
    // ─────────────────────────────────────────────────────────────────────────
    println!("✍️  Appending records...");
    let now = Utc::now();
    let mut records = Vec::new();
    for i in 0..5 {
        let at = now - chrono::Duration::days(2) + chrono::Duration::minutes(i);
        records.push(TypedRecord::new("gps", "phone", at, Payload::Gps(GpsFix::new(51.5 + i as f64 * 0.001, -0.12)))?);
        let pulse = HeartRate { bpm: 62 + i as i32, confidence: Some(0.9), rr_intervals: None };
        records.push(TypedRecord::new("heart_rate", "phone", at, Payload::HeartRate(pulse))?);
    }
    let ids = engine.append_batch(records).await?;
    let note = Note::new("note-1", "user-1", "Ran the canal loop");
    engine.append(TypedRecord::new("notes", "phone", now, Payload::Note(note))?).await?;
    println!("   ✓ {} sensor records and 1 note\n", ids.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Retention
    // ─────────────────────────────────────────────────────────────────────────
    println!("🧹 Running a retention pass...");
    let report = engine.run_retention_pass().await?;
    if let Some(counts) = report.counts("gps") {
        println!("   ✓ gps: {} compressed, {} expired", counts.compressed, counts.expired);
    }
    println!();

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Sync
    // ─────────────────────────────────────────────────────────────────────────
    println!("🔄 Pulling one unit for phone → laptop by hand...");
    let laptop = DevicePair::new("phone", "laptop");
    let batch = engine.pull_pending(&laptop, 4 * 1024).await?;
    println!("   ✓ {} record(s), {} bytes, first table: {:?}", batch.len(), batch.total_bytes, batch.tables.first().map(|t| &t.table));
    let acked = engine.ack_batch(batch.batch_id).await?;
    println!("   ✓ Acknowledged {acked}\n");

    println!("🔌 Connecting a worker for phone → tablet...");
    let tablet = DevicePair::new("phone", "tablet");
    engine.connect(tablet.clone(), Arc::new(PrintTransport))?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.disconnect(&tablet).await;
    println!();

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("📊 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✓ Engine state: {}", engine.state());

    Ok(())
}

/// One line per metric series, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = BTreeMap::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (kind, key) = composite_key.into_parts();
        let labels = key
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect::<Vec<_>>()
            .join(",");
        let series = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{labels}}}", key.name())
        };

        let rendered = match value {
            DebugValue::Counter(v) => format!("counter   {v}"),
            DebugValue::Gauge(v) => format!("gauge     {:.2}", v.into_inner()),
            DebugValue::Histogram(samples) if samples.is_empty() => "histogram (empty)".to_string(),
            DebugValue::Histogram(samples) => {
                let values: Vec<f64> = samples.iter().map(|s| s.into_inner()).collect();
                let total: f64 = values.iter().sum();
                let peak = values.iter().copied().fold(f64::MIN, f64::max);
                format!("histogram n={} mean={:.4} max={:.4}", values.len(), total / values.len() as f64, peak)
            }
        };
        lines.insert((series, format!("{kind:?}")), rendered);
    }

    if lines.is_empty() {
        println!("   (nothing recorded)");
        return;
    }
    for ((series, _), rendered) in &lines {
        println!("   {series:<48} {rendered}");
    }
}
