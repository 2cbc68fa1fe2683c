// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background retention evaluator.
//!
//! One pass walks every table that has a retention config, stream by
//! stream, then checks the global storage budget:
//!
//! ```text
//!   for each configured table, for each (device, table) stream:
//!       1. downsample   raw windows ending before now - downsample_after_days
//!       2. expire       raw records older than now - retention_days
//!       3. compress     typed bodies older than now - compress_after_days
//!   then:
//!       4. evict        lowest sync tier first while footprint > budget
//! ```
//!
//! A failing table is reported and skipped; the rest of the pass goes on.
//! Every step re-checks its records under the stream lock before writing,
//! so records appended or re-marked during a pass are never lost. A pass
//! that found nothing to do changes nothing, which makes passes
//! idempotent for a fixed clock and config.

pub mod downsample;
pub mod eviction;
pub mod report;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertSink, OperatorAlert};
use crate::backpressure::{ratio, StoragePressure};
use crate::compression::{compress_first_last, compress_payload, CompressionAlgorithm, CompressionError};
use crate::metrics;
use crate::record::{Lineage, Metadata, Record, RecordBody, RecordId, StreamKey};
use crate::registry::{ConfigRegistry, RegistrySnapshot, RetentionConfig};
use crate::storage::traits::TimeRange;
use crate::store::{RecordStore, StoreError};

use self::downsample::{group_sizes, reduce_group, window_start};
use self::eviction::{select_victims, EvictionCandidate};
pub use self::report::{EvictionReport, PassReport, RecordOutcome, TableCounts, TableOutcome, TableReport};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("compression of record {record_id} failed: {source}")]
    Compression {
        record_id: RecordId,
        #[source]
        source: CompressionError,
    },
}

/// Applies retention configs to the store.
pub struct RetentionEvaluator {
    store: Arc<RecordStore>,
    registry: Arc<ConfigRegistry>,
    alerts: AlertSink,
    /// Downsampling window width
    window: chrono::Duration,
    /// Held for the duration of a pass. Guards the pressure level the last
    /// pass ended at.
    pass_lock: Mutex<StoragePressure>,
}

impl RetentionEvaluator {
    pub fn new(
        store: Arc<RecordStore>,
        registry: Arc<ConfigRegistry>,
        alerts: AlertSink,
        window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            registry,
            alerts,
            window,
            pass_lock: Mutex::new(StoragePressure::Unbounded),
        }
    }

    /// Run passes every `interval` until `shutdown` flips to true.
    ///
    /// A pass in progress when shutdown arrives runs to completion. Ticks
    /// missed while a pass was running are skipped, not queued.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = interval.as_millis() as u64, "Retention evaluator started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_pass().await;
                        debug!(
                            changes = report.changes(),
                            failed = report.failed_tables().len(),
                            "Retention pass finished"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Retention evaluator stopped");
        })
    }

    /// Evaluate every configured table once, then enforce the budget.
    ///
    /// Waits for a pass already running to finish first.
    #[tracing::instrument(skip(self))]
    pub async fn run_pass(&self) -> PassReport {
        let mut last_pressure = self.pass_lock.lock().await;
        let started = Instant::now();
        let snapshot = self.registry.snapshot();
        let now = self.store.clock().now();

        let mut tables = Vec::with_capacity(snapshot.retention.len());
        for (table, config) in &snapshot.retention {
            let outcome = match self.evaluate_table(config, now).await {
                Ok(counts) => {
                    if counts.changes() > 0 || !counts.skipped.is_empty() {
                        info!(
                            table = %table,
                            downsampled = counts.records_downsampled,
                            derived = counts.derived_written,
                            expired = counts.expired,
                            summarized = counts.summarized,
                            compressed = counts.compressed,
                            skipped = counts.skipped.len(),
                            "Retention applied"
                        );
                    }
                    TableOutcome::Evaluated(counts)
                }
                Err(e) => {
                    error!(table = %table, error = %e, "Retention evaluation failed");
                    metrics::record_table_failure(table);
                    self.alerts.send(OperatorAlert::TableEvaluationFailed {
                        table: table.clone(),
                        error: e.to_string(),
                    });
                    TableOutcome::Failed { error: e.to_string() }
                }
            };
            tables.push(TableReport { table: table.clone(), outcome });
        }

        let (eviction, alert) = match self.enforce_budget(&snapshot, &mut last_pressure).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Emergency eviction failed");
                (None, None)
            }
        };

        metrics::record_pass_duration(started.elapsed());
        PassReport {
            started_at: now,
            registry_version: snapshot.version,
            tables,
            eviction,
            alert,
        }
    }

    async fn evaluate_table(&self, config: &RetentionConfig, now: DateTime<Utc>) -> Result<TableCounts, RetentionError> {
        let table = config.table_name.as_str();
        let mut counts = TableCounts::default();

        for key in self.store.streams(table).await? {
            if let Some((cutoff, ratio)) = config.downsample_cutoff(now) {
                self.downsample_stream(&key, cutoff, ratio, &mut counts).await?;
            }
            if let Some(cutoff) = config.expiry_cutoff(now) {
                self.expire_stream(&key, cutoff, config.spec.convert_to_text, &mut counts).await?;
            }
            if let Some(cutoff) = config.compress_cutoff(now) {
                self.compress_stream(&key, cutoff, config.spec.compression_algorithm, &mut counts)
                    .await?;
            }
        }

        metrics::record_retention(table, "downsample", counts.records_downsampled);
        metrics::record_retention(table, "expire", counts.expired);
        metrics::record_retention(table, "summarize", counts.summarized);
        metrics::record_retention(table, "compress", counts.compressed);
        Ok(counts)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Per-stream steps
    // ═══════════════════════════════════════════════════════════════════════

    async fn downsample_stream(
        &self,
        key: &StreamKey,
        cutoff: DateTime<Utc>,
        ratio: f64,
        counts: &mut TableCounts,
    ) -> Result<(), RetentionError> {
        // Only windows that have fully closed before the cutoff
        let limit = window_start(cutoff, self.window);
        let raw = self
            .store
            .scan_filtered(key, TimeRange::before(limit), None, usize::MAX, |r| r.lineage.is_raw())
            .await?;

        let mut windows: Vec<Vec<Record>> = Vec::new();
        let mut current_start = None;
        for record in raw {
            let start = window_start(record.timestamp, self.window);
            if current_start != Some(start) {
                windows.push(Vec::new());
                current_start = Some(start);
            }
            if let Some(window) = windows.last_mut() {
                window.push(record);
            }
        }

        'windows: for originals in windows {
            let sizes = group_sizes(originals.len(), ratio);
            if sizes.len() == originals.len() {
                continue;
            }

            let decoded = originals
                .iter()
                .cloned()
                .map(|r| self.store.decode(r))
                .collect::<Result<Vec<_>, _>>()?;

            let mut reduced = Vec::with_capacity(sizes.len());
            let mut rest = decoded.as_slice();
            for size in sizes {
                let (group, tail) = rest.split_at(size);
                rest = tail;
                let Some(record) = reduce_group(group) else {
                    warn!(stream = %key, start = %group[0].timestamp, "Window holds mixed payloads, left raw");
                    continue 'windows;
                };
                reduced.push(record);
            }

            if self.store.swap_window(&originals, &reduced).await? {
                counts.windows_downsampled += 1;
                counts.records_downsampled += originals.len();
                counts.derived_written += reduced.len();
            }
        }
        Ok(())
    }

    async fn expire_stream(
        &self,
        key: &StreamKey,
        cutoff: DateTime<Utc>,
        convert_to_text: bool,
        counts: &mut TableCounts,
    ) -> Result<(), RetentionError> {
        let expired = self
            .store
            .scan_filtered(key, TimeRange::before(cutoff), None, usize::MAX, |r| r.lineage.is_raw())
            .await?;
        if expired.is_empty() {
            return Ok(());
        }

        if !convert_to_text {
            counts.expired += self.store.delete_records(&expired).await?;
            return Ok(());
        }

        for record in expired {
            let kind = record.kind();
            let description = match self.store.decode(record.clone())?.payload() {
                Some(payload) => payload.describe(),
                None => kind.to_string(),
            };
            let summarized = self
                .store
                .rewrite(&record, |current| {
                    current.body = RecordBody::Summary { kind, description };
                    current.lineage = Lineage::Summarized;
                    current.metadata = Metadata::new();
                })
                .await?;
            if summarized {
                counts.summarized += 1;
            }
        }
        Ok(())
    }

    async fn compress_stream(
        &self,
        key: &StreamKey,
        cutoff: DateTime<Utc>,
        algorithm: CompressionAlgorithm,
        counts: &mut TableCounts,
    ) -> Result<(), RetentionError> {
        let candidates = self
            .store
            .scan_filtered(key, TimeRange::before(cutoff), None, usize::MAX, |r| {
                !matches!(r.lineage, Lineage::Summarized)
                    && matches!(r.body, RecordBody::Typed(_) | RecordBody::FirstLast { .. })
            })
            .await?;

        let codec = self.store.codec();
        for record in candidates {
            let compressed = match &record.body {
                RecordBody::Typed(payload) => compress_payload(codec.as_ref(), algorithm, payload),
                RecordBody::FirstLast { first, last } => compress_first_last(codec.as_ref(), algorithm, first, last),
                _ => continue,
            };
            match compressed {
                Ok((body, stats)) => {
                    if self.store.replace_body(&record, body).await? {
                        counts.compressed += 1;
                        metrics::record_compression_savings(&key.table, stats.original_bytes, stats.compressed_bytes);
                    }
                }
                Err(source) => {
                    let err = RetentionError::Compression { record_id: record.id, source };
                    warn!(stream = %key, record_id = %record.id, error = %err, "Compression skipped, original kept");
                    metrics::record_compression_failure(&key.table, algorithm.as_str());
                    self.alerts.send(OperatorAlert::CompressionFailure {
                        table: key.table.clone(),
                        record_id: record.id,
                        error: err.to_string(),
                    });
                    counts.skipped.push(RecordOutcome::CompressionSkipped { record_id: record.id, error: err.to_string() });
                }
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Storage budget
    // ═══════════════════════════════════════════════════════════════════════

    async fn enforce_budget(
        &self,
        snapshot: &RegistrySnapshot,
        last_pressure: &mut StoragePressure,
    ) -> Result<(Option<EvictionReport>, Option<OperatorAlert>), RetentionError> {
        let footprint = self.store.footprint_bytes().await?;
        metrics::set_storage_footprint(footprint);

        let budget = snapshot.storage_budget_bytes();
        let Some(budget) = budget else {
            Self::note_pressure(last_pressure, StoragePressure::Unbounded, footprint, None);
            self.store.set_degraded(false);
            return Ok((None, None));
        };
        metrics::set_storage_pressure(ratio(footprint, budget));

        let pressure = StoragePressure::from_usage(footprint, Some(budget));
        let mut report = EvictionReport {
            budget_bytes: budget,
            footprint_before: footprint,
            footprint_after: footprint,
            pressure,
            ..EvictionReport::default()
        };

        if pressure.needs_eviction() {
            let mut candidates = Vec::new();
            for table in self.store.tables().await? {
                let priority = snapshot.sync_policy(&table).priority;
                for key in self.store.streams(&table).await? {
                    let records = self
                        .store
                        .scan_filtered(&key, TimeRange::all(), None, usize::MAX, |_| true)
                        .await?;
                    candidates.extend(records.iter().map(|r| EvictionCandidate::of(r, priority)));
                }
            }

            let (victims, _) = select_victims(candidates, footprint - budget);
            let mut by_stream: BTreeMap<StreamKey, (Vec<RecordId>, u64)> = BTreeMap::new();
            for victim in victims {
                let entry = by_stream.entry(victim.key).or_default();
                entry.0.push(victim.id);
                entry.1 += victim.size_bytes;
            }

            let mut freed_by_table: BTreeMap<String, u64> = BTreeMap::new();
            for (key, (ids, bytes)) in by_stream {
                let evicted = self.store.delete_in_stream(&key, &ids).await?;
                report.evicted += evicted;
                *report.evicted_by_table.entry(key.table.clone()).or_default() += evicted;
                *freed_by_table.entry(key.table).or_default() += bytes;
            }
            for (table, count) in &report.evicted_by_table {
                let bytes = freed_by_table.get(table).copied().unwrap_or_default();
                metrics::record_eviction(table, *count, bytes);
                metrics::record_retention(table, "evict", *count);
            }

            report.footprint_after = self.store.footprint_bytes().await?;
            metrics::set_storage_footprint(report.footprint_after);
            metrics::set_storage_pressure(ratio(report.footprint_after, budget));
            info!(
                budget_bytes = budget,
                before = report.footprint_before,
                after = report.footprint_after,
                evicted = report.evicted,
                "Emergency eviction ran"
            );
            report.pressure = StoragePressure::from_usage(report.footprint_after, Some(budget));
        }
        Self::note_pressure(last_pressure, report.pressure, report.footprint_after, Some(budget));

        let alert = if report.footprint_after > budget {
            let alert = OperatorAlert::StorageExhausted {
                footprint_bytes: report.footprint_after,
                budget_bytes: budget,
            };
            error!(
                footprint_bytes = report.footprint_after,
                budget_bytes = budget,
                "Storage exhausted, nothing evictable left"
            );
            metrics::record_storage_exhausted();
            self.alerts.send(alert.clone());
            self.store.set_degraded(true);
            Some(alert)
        } else {
            self.store.set_degraded(false);
            None
        };

        Ok((Some(report), alert))
    }

    /// Log when the pressure tier differs from the previous pass.
    fn note_pressure(last: &mut StoragePressure, current: StoragePressure, footprint: u64, budget: Option<u64>) {
        if *last == current {
            return;
        }
        let previous = std::mem::replace(last, current);
        if current > previous && current >= StoragePressure::Warn {
            warn!(
                footprint_bytes = footprint,
                budget_bytes = budget,
                from = %previous,
                "Storage pressure rose: {current}"
            );
        } else {
            info!(
                footprint_bytes = footprint,
                budget_bytes = budget,
                from = %previous,
                "Storage pressure now: {current}"
            );
        }
    }
}
