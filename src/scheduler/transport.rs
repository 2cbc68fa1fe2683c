// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery seam between the scheduler and the network.
//!
//! The crate ships no transport. Hosts implement [`SyncTransport`] over
//! whatever link connects two devices; returning `Ok` means the peer has
//! durably accepted every record in the batch.

use async_trait::async_trait;
use thiserror::Error;

use super::batch::SyncBatch;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("peer rejected batch: {0}")]
    Rejected(String),

    #[error("delivery timed out")]
    Timeout,
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn deliver(&self, batch: &SyncBatch) -> Result<(), TransportError>;
}
