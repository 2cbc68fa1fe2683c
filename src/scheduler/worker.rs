// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pair delivery task.
//!
//! ```text
//!   loop:
//!     pull_pending ──empty──► sleep(poll) ──► loop
//!          │
//!          ▼
//!     deliver(batch) ──ok──► ack_batch
//!          │
//!          └──err──► fail_batch (backoff / failed-terminal)
//! ```
//!
//! Delivery is sequential within a pair. Shutdown interrupts a delivery
//! in progress; the unacknowledged batch stays in flight until
//! [`SyncScheduler::disconnect`](super::SyncScheduler::disconnect)
//! releases it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::record::DevicePair;

use super::transport::SyncTransport;
use super::SyncScheduler;

pub(crate) struct WorkerHandle {
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) task: JoinHandle<()>,
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `poll`, returning true if shutdown arrived first.
async fn idle(shutdown: &mut watch::Receiver<bool>, poll: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(poll) => false,
        _ = stopped(shutdown) => true,
    }
}

#[tracing::instrument(skip(scheduler, transport, shutdown), fields(pair = %pair))]
pub(crate) async fn run(
    scheduler: Arc<SyncScheduler>,
    pair: DevicePair,
    transport: Arc<dyn SyncTransport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = scheduler.settings().poll_interval;
    let max_bytes = scheduler.settings().max_bytes;
    info!("Sync worker started");

    loop {
        let stop = *shutdown.borrow();
        if stop {
            break;
        }

        let batch = match scheduler.pull_pending(&pair, max_bytes).await {
            Ok(batch) if !batch.is_empty() => batch,
            Ok(_) => {
                if idle(&mut shutdown, poll).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Could not compose sync unit");
                if idle(&mut shutdown, poll).await {
                    break;
                }
                continue;
            }
        };

        let delivered = tokio::select! {
            result = transport.deliver(&batch) => result,
            _ = stopped(&mut shutdown) => {
                debug!(batch_id = %batch.batch_id, "Delivery interrupted by shutdown");
                break;
            }
        };

        match delivered {
            Ok(()) => {
                if let Err(e) = scheduler.ack_batch(batch.batch_id).await {
                    warn!(batch_id = %batch.batch_id, error = %e, "Failed to record acknowledgment");
                }
            }
            Err(e) => {
                warn!(batch_id = %batch.batch_id, records = batch.len(), error = %e, "Delivery failed");
                match scheduler.fail_batch(batch.batch_id).await {
                    Ok(outcome) => debug!(
                        retrying = outcome.retrying.len(),
                        exhausted = outcome.exhausted_ids().len(),
                        "Failure recorded"
                    ),
                    Err(e) => warn!(batch_id = %batch.batch_id, error = %e, "Failed to record delivery failure"),
                }
            }
        }
    }

    info!("Sync worker stopped");
}
