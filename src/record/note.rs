// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Notes, known entities and the join rows between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{require_finite, Metadata, ValidationError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A user note, carried as the body of a `note` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Stable note id, distinct from the record id
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub priority: NotePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Note {
    #[must_use]
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            content: content.into(),
            priority: NotePriority::default(),
            parent_id: None,
            tags: None,
            embedding: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: NotePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::new("note.id", "must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::new("note.user_id", "must not be empty"));
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::new("note.content", "must not be empty"));
        }
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::new("note.parent_id", "a note cannot be its own parent"));
        }
        if let Some(tags) = &self.tags {
            if tags.iter().any(|t| t.trim().is_empty()) {
                return Err(ValidationError::new("note.tags", "tags must not be empty"));
            }
        }
        validate_embedding("note.embedding", self.embedding.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Face,
    Object,
    Pose,
    Audio,
}

/// A recognized person, object, pose or sound that notes and
/// reference records can point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; deleted entities cannot gain new references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl KnownEntity {
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: EntityType,
        label: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
            label: label.into(),
            embedding: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entity_id.trim().is_empty() {
            return Err(ValidationError::new("entity_id", "must not be empty"));
        }
        if self.label.trim().is_empty() {
            return Err(ValidationError::new("label", "must not be empty"));
        }
        validate_embedding("embedding", self.embedding.as_deref())
    }
}

/// Many-to-many join row from a note to anything it mentions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteReference {
    pub note_id: String,
    /// What `reference_id` names, e.g. `entity` or `note`
    pub reference_type: String,
    pub reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Reference type for rows that point at a [`KnownEntity`]
pub const REFERENCE_TYPE_ENTITY: &str = "entity";
/// Reference type for rows that point at another note
pub const REFERENCE_TYPE_NOTE: &str = "note";

impl NoteReference {
    #[must_use]
    pub fn to_entity(note_id: impl Into<String>, entity_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            note_id: note_id.into(),
            reference_type: REFERENCE_TYPE_ENTITY.to_string(),
            reference_id: entity_id.into(),
            timestamp: None,
            metadata: Metadata::new(),
            created_at: now,
        }
    }

    /// Identity of the join row; duplicates on this key are idempotent.
    #[must_use]
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.note_id, &self.reference_type, &self.reference_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.note_id.trim().is_empty() {
            return Err(ValidationError::new("note_id", "must not be empty"));
        }
        if self.reference_id.trim().is_empty() {
            return Err(ValidationError::new("reference_id", "must not be empty"));
        }
        match self.reference_type.as_str() {
            REFERENCE_TYPE_ENTITY | REFERENCE_TYPE_NOTE => Ok(()),
            other => Err(ValidationError::new(
                "reference_type",
                format!("unknown reference type `{other}`"),
            )),
        }
    }
}

/// Record body for an observation of a known entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReference {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl EntityReference {
    #[must_use]
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self { entity_id: entity_id.into(), confidence: None, context: None }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.entity_id.trim().is_empty() {
            return Err(ValidationError::new("entity_id", "must not be empty"));
        }
        if let Some(c) = self.confidence {
            super::require_range("confidence", c.into(), 0.0, 1.0)?;
        }
        Ok(())
    }
}

fn validate_embedding(field: &str, embedding: Option<&[f32]>) -> Result<(), ValidationError> {
    match embedding {
        Some([]) => Err(ValidationError::new(field, "must not be empty when present")),
        Some(values) => values.iter().try_for_each(|v| require_finite(field, (*v).into())),
        None => Ok(()),
    }
}
