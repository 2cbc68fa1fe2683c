// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operator-facing alerts.
//!
//! Conditions that need a human (storage exhausted, a table that keeps
//! failing evaluation, records that gave up syncing) are broadcast on a
//! `tokio::sync::broadcast` channel. Having no subscribers is fine; the
//! same information is also in pass reports and metrics.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::record::{DevicePair, RecordId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum OperatorAlert {
    /// Emergency eviction ran out of candidates while still over budget.
    /// Ingestion continues in degraded mode.
    StorageExhausted { footprint_bytes: u64, budget_bytes: u64 },
    TableEvaluationFailed { table: String, error: String },
    CompressionFailure { table: String, record_id: RecordId, error: String },
    SyncRetryExhausted { pair: DevicePair, record_ids: Vec<RecordId> },
}

/// Cloneable sender half of the alert channel.
#[derive(Debug, Clone)]
pub struct AlertSink {
    tx: broadcast::Sender<OperatorAlert>,
}

impl AlertSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorAlert> {
        self.tx.subscribe()
    }

    pub fn send(&self, alert: OperatorAlert) {
        if self.tx.send(alert).is_err() {
            debug!("Operator alert dropped, no subscribers");
        }
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alerts_reach_subscribers() {
        let sink = AlertSink::new(4);
        let mut rx = sink.subscribe();
        sink.send(OperatorAlert::StorageExhausted { footprint_bytes: 10, budget_bytes: 5 });
        assert_eq!(
            rx.recv().await.unwrap(),
            OperatorAlert::StorageExhausted { footprint_bytes: 10, budget_bytes: 5 }
        );
    }

    #[test]
    fn test_send_without_subscribers_is_harmless() {
        let sink = AlertSink::new(4);
        sink.send(OperatorAlert::TableEvaluationFailed { table: "gps".into(), error: "boom".into() });
    }
}
