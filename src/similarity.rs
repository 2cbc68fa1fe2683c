// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contract for the entity similarity collaborator.
//!
//! The store does not compute embeddings or nearest neighbours. A host
//! plugs in an index; [`crate::RecordStore::similar_entities`] asks it for
//! candidates and filters out ids that are unknown or soft-deleted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedId {
    pub id: String,
    /// Higher is more similar
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
#[error("similarity index error: {0}")]
pub struct SimilarityError(pub String);

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Up to `k` entities most similar to `entity_id`, best first.
    async fn similar(&self, entity_id: &str, k: usize) -> Result<Vec<RankedId>, SimilarityError>;
}
