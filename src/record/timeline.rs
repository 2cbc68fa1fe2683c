// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Lineage, Payload, PayloadKind, Record, RecordBody, RecordId};

/// One entry of a device's merged event history, as handed to a
/// rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub record_id: RecordId,
    pub table: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PayloadKind,
    pub lineage: Lineage,
    pub description: String,
    /// Present unless the record was reduced to a summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Last payload of a downsampled first/last group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_payload: Option<Payload>,
}

impl From<Record> for TimelineItem {
    fn from(record: Record) -> Self {
        let kind = record.kind();
        let (description, payload, last_payload) = match record.body {
            RecordBody::Typed(payload) => (payload.describe(), Some(payload), None),
            RecordBody::FirstLast { first, last } => {
                (format!("{} .. {}", first.describe(), last.describe()), Some(first), Some(last))
            }
            RecordBody::Summary { description, .. } => (description, None, None),
            // Readers get decoded bodies; a compressed body here means
            // decode was skipped upstream.
            RecordBody::Compressed { .. } => (format!("{kind} (compressed)"), None, None),
        };
        Self {
            record_id: record.id,
            table: record.table,
            device_id: record.device_id,
            timestamp: record.timestamp,
            kind,
            lineage: record.lineage,
            description,
            payload,
            last_payload,
        }
    }
}
