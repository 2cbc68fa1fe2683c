// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed record model.
//!
//! A [`TypedRecord`] is what a device hands to the store: table, device,
//! timestamp, metadata and one [`Payload`]. Once persisted it becomes a
//! [`Record`], which adds identity, ingestion time, lineage and per-pair
//! sync marks.
//!
//! ```text
//!   TypedRecord ──append──► Record { body: Typed, lineage: Raw }
//!                               │
//!                   ┌───────────┼─────────────┐
//!                   ▼           ▼             ▼
//!              Downsampled  Summarized    Compressed body
//!              (replaces N) (text only)   (decoded on read)
//! ```

pub mod device;
pub mod metadata;
pub mod note;
pub mod payload;
pub mod sensor;
pub mod timeline;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::compression::CompressionAlgorithm;

pub use device::{Device, DeviceCapabilities, DeviceType, ScreenDetails};
pub use metadata::{Metadata, MetadataValue};
pub use note::{EntityReference, EntityType, KnownEntity, Note, NotePriority, NoteReference};
pub use payload::{Payload, PayloadKind};
pub use timeline::TimelineItem;

/// Maximum table name length
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Input rejected at the boundary. Nothing is written when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

pub fn validate_table_name(table: &str) -> Result<(), ValidationError> {
    if table.is_empty() || table.len() > MAX_TABLE_NAME_LEN {
        return Err(ValidationError::new(
            "table",
            format!("name must be 1..={MAX_TABLE_NAME_LEN} characters"),
        ));
    }
    if !table
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(ValidationError::new(
            "table",
            format!("`{table}` may only contain [a-z0-9_]"),
        ));
    }
    Ok(())
}

pub(crate) fn require_finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new(field, "must be a finite number"))
    }
}

pub(crate) fn require_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    require_finite(field, value)?;
    if value < min || value > max {
        return Err(ValidationError::new(field, format!("{value} is outside [{min}, {max}]")));
    }
    Ok(())
}

/// Time-ordered record identity (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::new("record_id", e.to_string()))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One device's records in one table. The unit of write serialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub device_id: String,
    pub table: String,
}

impl StreamKey {
    pub fn new(device_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self { device_id: device_id.into(), table: table.into() }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.table)
    }
}

/// Directed sync relationship: records originating at `source` flow to `target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevicePair {
    pub source: String,
    pub target: String,
}

impl DevicePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into() }
    }
}

impl fmt::Display for DevicePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// Inclusive timestamp span covered by a derived record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lineage {
    /// As ingested, still subject to retention
    #[default]
    Raw,
    /// Reduced from `source_count` raw records spanning `span`
    Downsampled { span: TimeSpan, source_count: usize },
    /// Replaced by a text description
    Summarized,
}

impl Lineage {
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "body", rename_all = "snake_case")]
pub enum RecordBody {
    Typed(Payload),
    Compressed {
        algorithm: CompressionAlgorithm,
        kind: PayloadKind,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
        original_len: usize,
    },
    Summary {
        kind: PayloadKind,
        description: String,
    },
    /// A downsampled group of a non-numeric kind: its first and last
    /// payloads. The group size is in [`Lineage::Downsampled`].
    FirstLast {
        first: Payload,
        last: Payload,
    },
}

impl RecordBody {
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Typed(p) | Self::FirstLast { first: p, .. } => p.kind(),
            Self::Compressed { kind, .. } | Self::Summary { kind, .. } => *kind,
        }
    }

    pub(crate) fn size_bytes(&self) -> usize {
        match self {
            Self::Typed(p) => p.encoded_len(),
            Self::Compressed { bytes, .. } => bytes.len(),
            Self::Summary { description, .. } => description.len(),
            Self::FirstLast { first, last } => first.encoded_len() + last.encoded_len(),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// A persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub table: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Store clock at first append; pending age is measured from here
    pub ingested_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub body: RecordBody,
    #[serde(default)]
    pub lineage: Lineage,
    /// Pairs that acknowledged this record
    #[serde(default)]
    pub synced_to: BTreeSet<DevicePair>,
    /// Pairs that gave up on this record after exhausting retries
    #[serde(default)]
    pub failed_to: BTreeSet<DevicePair>,
}

impl Record {
    #[must_use]
    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.device_id, &self.table)
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        self.body.kind()
    }

    /// The payload, when the body is in plain typed form. For a first/last
    /// body this is the first one.
    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            RecordBody::Typed(p) | RecordBody::FirstLast { first: p, .. } => Some(p),
            _ => None,
        }
    }

    /// The latest payload the record still holds.
    #[must_use]
    pub fn last_payload(&self) -> Option<&Payload> {
        match &self.body {
            RecordBody::Typed(p) | RecordBody::FirstLast { last: p, .. } => Some(p),
            _ => None,
        }
    }

    /// Note id carried by a note record.
    #[must_use]
    pub fn note_id(&self) -> Option<&str> {
        match self.payload() {
            Some(Payload::Note(n)) => Some(&n.id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_pending_for(&self, pair: &DevicePair) -> bool {
        self.device_id == pair.source && !self.synced_to.contains(pair) && !self.failed_to.contains(pair)
    }

    #[must_use]
    pub fn is_synced_anywhere(&self) -> bool {
        !self.synced_to.is_empty()
    }

    /// Approximate stored footprint
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        let pairs: usize = self
            .synced_to
            .iter()
            .chain(self.failed_to.iter())
            .map(|p| p.source.len() + p.target.len())
            .sum();
        // id + two timestamps
        16 + 16
            + self.table.len()
            + self.device_id.len()
            + self.metadata.size_bytes()
            + self.body.size_bytes()
            + pairs
    }
}

/// Validated ingestion input.
///
/// Fields are private so every instance has passed validation; build one
/// with [`TypedRecord::new`] or [`TypedRecord::from_json`]. Timestamps are
/// truncated to microseconds, the resolution every backend keeps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedRecord {
    table: String,
    device_id: String,
    timestamp: DateTime<Utc>,
    metadata: Metadata,
    payload: Payload,
}

#[derive(Deserialize)]
struct UncheckedRecord {
    table: String,
    device_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: Metadata,
    payload: Payload,
}

impl TypedRecord {
    pub fn new(
        table: impl Into<String>,
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Payload,
    ) -> Result<Self, ValidationError> {
        let record = Self {
            table: table.into(),
            device_id: device_id.into(),
            timestamp: timestamp.trunc_subsecs(6),
            metadata: Metadata::new(),
            payload,
        };
        record.validate()?;
        Ok(record)
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let raw: UncheckedRecord =
            serde_json::from_str(json).map_err(|e| ValidationError::new("record", e.to_string()))?;
        let record = Self {
            table: raw.table,
            device_id: raw.device_id,
            timestamp: raw.timestamp.trunc_subsecs(6),
            metadata: raw.metadata,
            payload: raw.payload,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        validate_table_name(&self.table)?;
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::new("device_id", "must not be empty"));
        }
        self.payload.validate()
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn key(&self) -> StreamKey {
        StreamKey::new(&self.device_id, &self.table)
    }

    pub(crate) fn into_record(self, id: RecordId, ingested_at: DateTime<Utc>) -> Record {
        Record {
            id,
            table: self.table,
            device_id: self.device_id,
            timestamp: self.timestamp,
            ingested_at,
            metadata: self.metadata,
            body: RecordBody::Typed(self.payload),
            lineage: Lineage::Raw,
            synced_to: BTreeSet::new(),
            failed_to: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sensor::GpsFix;
    use super::*;

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("gps_data").is_ok());
        assert!(validate_table_name("t2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("GPS").is_err());
        assert!(validate_table_name("gps-data").is_err());
        assert!(validate_table_name(&"a".repeat(65)).is_err());
        assert!(validate_table_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_typed_record_validates() {
        let now = Utc::now();
        assert!(TypedRecord::new("gps", "phone", now, Payload::Gps(GpsFix::new(1.0, 2.0))).is_ok());
        assert!(TypedRecord::new("gps", "", now, Payload::Gps(GpsFix::new(1.0, 2.0))).is_err());
        let err = TypedRecord::new("gps", "phone", now, Payload::Gps(GpsFix::new(100.0, 2.0)))
            .unwrap_err();
        assert_eq!(err.field, "latitude");
    }

    #[test]
    fn test_from_json_validates() {
        let json = r#"{
            "table": "gps",
            "device_id": "phone",
            "timestamp": "2026-01-01T00:00:00Z",
            "metadata": {"provider": "fused"},
            "payload": {"kind": "gps", "data": {"latitude": 10.0, "longitude": 20.0}}
        }"#;
        let rec = TypedRecord::from_json(json).unwrap();
        assert_eq!(rec.kind(), PayloadKind::Gps);
        assert_eq!(rec.metadata().len(), 1);

        let bad = json.replace("10.0", "95.0");
        assert!(TypedRecord::from_json(&bad).is_err());
    }

    #[test]
    fn test_pending_for_pair() {
        let now = Utc::now();
        let rec = TypedRecord::new("gps", "phone", now, Payload::Gps(GpsFix::new(1.0, 2.0)))
            .unwrap()
            .into_record(RecordId::new(), now);
        let out = DevicePair::new("phone", "laptop");
        let inbound = DevicePair::new("laptop", "phone");
        assert!(rec.is_pending_for(&out));
        assert!(!rec.is_pending_for(&inbound));

        let mut synced = rec.clone();
        synced.synced_to.insert(out.clone());
        assert!(!synced.is_pending_for(&out));
        assert!(synced.is_synced_anywhere());
    }

    #[test]
    fn test_compressed_body_serializes_hex() {
        let body = RecordBody::Compressed {
            algorithm: CompressionAlgorithm::Lz4,
            kind: PayloadKind::Gps,
            bytes: vec![0xde, 0xad],
            original_len: 2,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["bytes"], "dead");
        let back: RecordBody = serde_json::from_value(json).unwrap();
        assert_eq!(back, body);
    }
}
