// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Devices, known entities and note references.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::record::note::{REFERENCE_TYPE_ENTITY, REFERENCE_TYPE_NOTE};
use crate::record::{Device, KnownEntity, NoteReference};
use crate::similarity::{RankedId, SimilarityIndex};

use super::{RecordStore, StoreError};

impl RecordStore {
    // ═══════════════════════════════════════════════════════════════════════
    // Devices
    // ═══════════════════════════════════════════════════════════════════════

    /// Register or update a device. Re-registering keeps the original
    /// `created_at` and never moves `last_seen` backwards.
    pub fn register_device(&self, device: Device) -> Result<(), StoreError> {
        device.validate()?;
        match self.devices.entry(device.device_id.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                let updated = Device {
                    created_at: existing.created_at,
                    last_seen: existing.last_seen.max(device.last_seen),
                    updated_at: self.clock.now().max(existing.updated_at),
                    ..device
                };
                slot.insert(updated);
            }
            Entry::Vacant(slot) => {
                slot.insert(device);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    /// Advance a registered device's `last_seen`. Returns true when it moved.
    pub fn touch_device(&self, device_id: &str, at: DateTime<Utc>) -> bool {
        self.devices.get_mut(device_id).map_or(false, |mut d| d.touch(at))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entities
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace an entity. Replacing keeps the stored `created_at`.
    pub async fn put_entity(&self, mut entity: KnownEntity) -> Result<(), StoreError> {
        entity.validate()?;
        if let Some(existing) = self.backend.get_entity(&entity.entity_id).await? {
            entity.created_at = existing.created_at;
        }
        self.backend.put_entity(&entity).await?;
        Ok(())
    }

    pub async fn entity(&self, entity_id: &str) -> Result<Option<KnownEntity>, StoreError> {
        Ok(self.backend.get_entity(entity_id).await?)
    }

    /// Soft-delete. Existing references stay; new ones are refused.
    pub async fn delete_entity(&self, entity_id: &str) -> Result<(), StoreError> {
        let mut entity = self
            .backend
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("entity `{entity_id}`")))?;
        if entity.is_deleted() {
            return Ok(());
        }
        let now = self.clock.now();
        entity.deleted_at = Some(now);
        entity.updated_at = now;
        self.backend.put_entity(&entity).await?;
        debug!(entity_id, "Entity soft-deleted");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Note references
    // ═══════════════════════════════════════════════════════════════════════

    /// Link a note to an entity or another note.
    ///
    /// Returns false when the same link already existed.
    pub async fn add_reference(&self, reference: NoteReference) -> Result<bool, StoreError> {
        reference.validate()?;
        self.require_note(&reference.note_id).await?;
        match reference.reference_type.as_str() {
            REFERENCE_TYPE_ENTITY => self.require_live_entity(&reference.reference_id).await?,
            REFERENCE_TYPE_NOTE => self.require_note(&reference.reference_id).await?,
            _ => {}
        }
        Ok(self.backend.put_reference(&reference).await?)
    }

    pub async fn references_for_note(&self, note_id: &str) -> Result<Vec<NoteReference>, StoreError> {
        Ok(self.backend.references_for_note(note_id).await?)
    }

    async fn require_note(&self, note_id: &str) -> Result<(), StoreError> {
        match self.backend.find_note(note_id).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::ReferentialIntegrity { kind: "note", id: note_id.to_string() }),
        }
    }

    /// Entities most similar to `entity_id` according to `index`, with
    /// unknown, soft-deleted and self matches removed.
    pub async fn similar_entities(
        &self,
        index: &dyn SimilarityIndex,
        entity_id: &str,
        k: usize,
    ) -> Result<Vec<RankedId>, StoreError> {
        let candidates = index.similar(entity_id, k).await?;
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.id == entity_id {
                continue;
            }
            match self.backend.get_entity(&candidate.id).await? {
                Some(entity) if !entity.is_deleted() => kept.push(candidate),
                _ => debug!(candidate = %candidate.id, "Dropping stale similarity match"),
            }
        }
        kept.truncate(k);
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::ManualClock;
    use crate::record::note::Note;
    use crate::record::{EntityReference, EntityType, Payload, TypedRecord};
    use crate::similarity::SimilarityError;
    use crate::storage::memory::MemoryBackend;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryBackend::new())).with_clock(Arc::new(ManualClock::new(t0())))
    }

    async fn add_note(store: &RecordStore, id: &str, secs: i64) {
        let rec = TypedRecord::new(
            "notes",
            "phone",
            t0() + Duration::seconds(secs),
            Payload::Note(Note::new(id, "user", "text")),
        )
        .unwrap();
        store.append(rec).await.unwrap();
    }

    #[tokio::test]
    async fn test_last_seen_never_decreases() {
        let store = store();
        store.register_device(Device::new("phone", "user", t0())).unwrap();
        assert!(store.touch_device("phone", t0() + Duration::minutes(5)));
        assert!(!store.touch_device("phone", t0() + Duration::minutes(1)));
        assert_eq!(store.device("phone").unwrap().last_seen, t0() + Duration::minutes(5));

        // Re-registering with a stale last_seen keeps the newer one
        store.register_device(Device::new("phone", "user", t0())).unwrap();
        assert_eq!(store.device("phone").unwrap().last_seen, t0() + Duration::minutes(5));
        assert!(!store.touch_device("unknown", t0()));
    }

    #[tokio::test]
    async fn test_append_touches_registered_device() {
        let store = store();
        store.register_device(Device::new("phone", "user", t0() - Duration::hours(1))).unwrap();
        add_note(&store, "n1", 0).await;
        assert_eq!(store.device("phone").unwrap().last_seen, t0());
    }

    #[tokio::test]
    async fn test_reference_requires_both_ends() {
        let store = store();
        let link = NoteReference::to_entity("n1", "face-1", t0());
        assert!(matches!(
            store.add_reference(link.clone()).await,
            Err(StoreError::ReferentialIntegrity { kind: "note", .. })
        ));

        add_note(&store, "n1", 0).await;
        assert!(matches!(
            store.add_reference(link.clone()).await,
            Err(StoreError::ReferentialIntegrity { kind: "entity", .. })
        ));

        store
            .put_entity(KnownEntity::new("face-1", EntityType::Face, "Alice", t0()))
            .await
            .unwrap();
        assert!(store.add_reference(link.clone()).await.unwrap());
        assert!(!store.add_reference(link).await.unwrap());
        assert_eq!(store.references_for_note("n1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_entity_refuses_new_references() {
        let store = store();
        store
            .put_entity(KnownEntity::new("obj-1", EntityType::Object, "mug", t0()))
            .await
            .unwrap();
        store.delete_entity("obj-1").await.unwrap();
        assert!(store.entity("obj-1").await.unwrap().unwrap().is_deleted());

        let rec = TypedRecord::new("sightings", "phone", t0(), Payload::EntityReference(EntityReference::new("obj-1")))
            .unwrap();
        assert!(matches!(
            store.append(rec).await,
            Err(StoreError::ReferentialIntegrity { kind: "entity", .. })
        ));
        assert!(matches!(store.delete_entity("missing").await, Err(StoreError::NotFound(_))));
    }

    struct FixedIndex(Vec<RankedId>);

    #[async_trait]
    impl SimilarityIndex for FixedIndex {
        async fn similar(&self, _entity_id: &str, k: usize) -> Result<Vec<RankedId>, SimilarityError> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_similar_entities_filters_missing_and_deleted() {
        let store = store();
        for id in ["a", "b", "c"] {
            store.put_entity(KnownEntity::new(id, EntityType::Face, id, t0())).await.unwrap();
        }
        store.delete_entity("c").await.unwrap();
        let index = FixedIndex(
            ["a", "b", "ghost", "c"]
                .iter()
                .enumerate()
                .map(|(i, id)| RankedId { id: id.to_string(), score: 1.0 - i as f32 * 0.1 })
                .collect(),
        );
        let ranked = store.similar_entities(&index, "a", 4).await.unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }
}
