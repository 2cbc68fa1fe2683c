// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query requests, status filters and restartable cursors.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{DevicePair, Lineage, Record, RecordId, ValidationError};
use crate::storage::traits::{ScanPosition, TimeRange};

/// Default page size when a request does not set one
pub const DEFAULT_PAGE_LIMIT: usize = 100;
/// Upper bound on a single page
pub const MAX_PAGE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    Any,
    PendingSync(DevicePair),
    Synced(DevicePair),
    FailedTerminal(DevicePair),
    Raw,
    Downsampled,
    Summarized,
}

impl StatusFilter {
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Any => true,
            Self::PendingSync(pair) => record.is_pending_for(pair),
            Self::Synced(pair) => record.synced_to.contains(pair),
            Self::FailedTerminal(pair) => record.failed_to.contains(pair),
            Self::Raw => matches!(record.lineage, Lineage::Raw),
            Self::Downsampled => matches!(record.lineage, Lineage::Downsampled { .. }),
            Self::Summarized => matches!(record.lineage, Lineage::Summarized),
        }
    }
}

/// Opaque position after the last record of a page.
///
/// Holds no server-side state, so a client can resume with it at any
/// later time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor {
    timestamp: DateTime<Utc>,
    id: RecordId,
}

impl Cursor {
    #[must_use]
    pub fn after(record: &Record) -> Self {
        Self { timestamp: record.timestamp, id: record.id }
    }

    #[must_use]
    pub fn to_token(&self) -> String {
        format!("{}:{}", self.timestamp.timestamp_micros(), self.id)
    }

    pub fn from_token(token: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::new("cursor", format!("malformed token `{token}`"));
        let (micros, id) = token.split_once(':').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let timestamp = Utc.timestamp_micros(micros).single().ok_or_else(invalid)?;
        let id = RecordId::parse(id).map_err(|_| invalid())?;
        Ok(Self { timestamp, id })
    }

    pub(crate) fn position(&self) -> ScanPosition {
        ScanPosition { timestamp: self.timestamp, id: self.id }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

impl TryFrom<String> for Cursor {
    type Error = ValidationError;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        Self::from_token(&token)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.to_token()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub table: String,
    /// Restrict to one device; all devices of the table when `None`
    pub device_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub status: StatusFilter,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

impl QueryRequest {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            device_id: None,
            since: None,
            until: None,
            status: StatusFilter::Any,
            cursor: None,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }

    #[must_use]
    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn after(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn range(&self) -> TimeRange {
        TimeRange { since: self.since, until: self.until }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        crate::record::validate_table_name(&self.table)?;
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::new("limit", format!("must be 1..={MAX_PAGE_LIMIT}")));
        }
        if let (Some(s), Some(u)) = (self.since, self.until) {
            if s > u {
                return Err(ValidationError::new("since", "must not be after until"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    /// Present when more records may follow
    pub next_cursor: Option<Cursor>,
}
