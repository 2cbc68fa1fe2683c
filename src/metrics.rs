// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for loom-store.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `loom_store_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size gauges/histograms
//!
//! # Labels
//! - `table`: record table name
//! - `action`: downsample, expire, summarize, compress, evict
//! - `outcome`: success, duplicate, rejected, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// INGESTION
// ═══════════════════════════════════════════════════════════════════════════

/// Record an append attempt
pub fn record_append(table: &str, outcome: &str) {
    counter!(
        "loom_store_appends_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an append accepted while storage is exhausted
pub fn record_degraded_append(table: &str) {
    counter!(
        "loom_store_degraded_appends_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record store operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "loom_store_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record data corruption detection
pub fn record_corruption(id: &str) {
    counter!(
        "loom_store_corruption_detected_total",
        "id" => id.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RETENTION - Evaluator pass metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record records touched by a retention action
pub fn record_retention(table: &str, action: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "loom_store_retention_records_total",
        "table" => table.to_string(),
        "action" => action.to_string()
    )
    .increment(count as u64);
}

/// Record a compression failure (original kept)
pub fn record_compression_failure(table: &str, algorithm: &str) {
    counter!(
        "loom_store_compression_failures_total",
        "table" => table.to_string(),
        "algorithm" => algorithm.to_string()
    )
    .increment(1);
}

/// Record bytes saved by compression
pub fn record_compression_savings(table: &str, original: usize, compressed: usize) {
    counter!(
        "loom_store_compressed_bytes_saved_total",
        "table" => table.to_string()
    )
    .increment(original.saturating_sub(compressed) as u64);
}

/// Record a table that failed evaluation
pub fn record_table_failure(table: &str) {
    counter!(
        "loom_store_retention_table_failures_total",
        "table" => table.to_string()
    )
    .increment(1);
}

/// Record evaluator pass duration
pub fn record_pass_duration(duration: Duration) {
    histogram!("loom_store_retention_pass_seconds").record(duration.as_secs_f64());
}

/// Set current storage footprint in bytes
pub fn set_storage_footprint(bytes: u64) {
    gauge!("loom_store_storage_footprint_bytes").set(bytes as f64);
}

/// Set storage pressure (footprint / budget)
pub fn set_storage_pressure(pressure: f64) {
    gauge!("loom_store_storage_pressure").set(pressure);
}

/// Record emergency eviction
pub fn record_eviction(table: &str, count: usize, bytes: u64) {
    counter!(
        "loom_store_evictions_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
    counter!("loom_store_evicted_bytes_total").increment(bytes);
}

/// Record a pass that could not get under budget
pub fn record_storage_exhausted() {
    counter!("loom_store_storage_exhausted_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC - Scheduler metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Set queued entries for a device pair
pub fn set_queue_depth(pair: &str, depth: usize) {
    gauge!(
        "loom_store_sync_queue_depth",
        "pair" => pair.to_string()
    )
    .set(depth as f64);
}

/// Record entries shed from a full queue
pub fn record_queue_dropped(pair: &str, count: usize) {
    counter!(
        "loom_store_sync_queue_dropped_total",
        "pair" => pair.to_string()
    )
    .increment(count as u64);
}

/// Record a composed sync batch
pub fn record_sync_batch(records: usize, bytes: usize) {
    histogram!("loom_store_sync_batch_size").record(records as f64);
    histogram!("loom_store_sync_batch_bytes").record(bytes as f64);
}

/// Record the outcome of a delivered batch (acked, failed, released)
pub fn record_sync_outcome(outcome: &str, records: usize) {
    counter!(
        "loom_store_sync_records_total",
        "outcome" => outcome.to_string()
    )
    .increment(records as u64);
}

/// Record records that exhausted their retries
pub fn record_retry_exhausted(table: &str, count: usize) {
    counter!(
        "loom_store_sync_retry_exhausted_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Set connected sync workers
pub fn set_sync_workers(count: usize) {
    gauge!("loom_store_sync_workers").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "loom_store_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "loom_store_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Timer guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
