// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read paths: point lookups, paged queries and the device timeline.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::metrics::LatencyTimer;
use crate::record::{DevicePair, Record, RecordId, StreamKey, TimelineItem};
use crate::storage::traits::{ScanPosition, TimeRange};

use super::query::{Cursor, Page, QueryRequest};
use super::{RecordStore, StoreError};

/// Records fetched per backend call while filtering a stream
const SCAN_CHUNK: usize = 512;

impl RecordStore {
    pub async fn get(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        match self.backend.get(id).await? {
            Some(record) => Ok(Some(self.decode(record)?)),
            None => Ok(None),
        }
    }

    /// One page of a table, timestamp ascending, ties broken by id.
    ///
    /// Nothing is held between pages. Resuming from `next_cursor` after
    /// concurrent appends yields every record positioned after the
    /// cursor exactly once.
    #[tracing::instrument(skip(self, request), fields(table = %request.table))]
    pub async fn query(&self, request: QueryRequest) -> Result<Page, StoreError> {
        request.validate()?;
        let _timer = LatencyTimer::new("query");

        let keys = match &request.device_id {
            Some(device) => vec![StreamKey::new(device, &request.table)],
            None => self.streams(&request.table).await?,
        };
        let range = request.range();
        let after = request.cursor.as_ref().map(Cursor::position);
        let wanted = request.limit + 1;

        let mut matched = Vec::new();
        for key in &keys {
            let found = self
                .scan_filtered(key, range, after, wanted, |r| request.status.matches(r))
                .await?;
            matched.extend(found);
        }
        matched.sort_by_key(ScanPosition::of);

        let has_more = matched.len() > request.limit;
        matched.truncate(request.limit);
        let next_cursor = if has_more { matched.last().map(Cursor::after) } else { None };
        let records = matched
            .into_iter()
            .map(|r| self.decode(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { records, next_cursor })
    }

    /// Up to `limit` records of a stream matching `keep`, in stream order.
    /// Bodies are returned as stored.
    pub(crate) async fn scan_filtered(
        &self,
        key: &StreamKey,
        range: TimeRange,
        mut after: Option<ScanPosition>,
        limit: usize,
        keep: impl Fn(&Record) -> bool,
    ) -> Result<Vec<Record>, StoreError> {
        let mut out = Vec::new();
        loop {
            let chunk = self.backend.scan(key, range, after, SCAN_CHUNK).await?;
            let exhausted = chunk.len() < SCAN_CHUNK;
            after = chunk.last().map(ScanPosition::of);
            out.extend(chunk.into_iter().filter(|r| keep(r)));
            if exhausted || after.is_none() || out.len() >= limit {
                break;
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    /// Every table holding at least one record, sorted.
    pub async fn tables(&self) -> Result<Vec<String>, StoreError> {
        let tables: BTreeSet<String> = self.backend.streams().await?.into_iter().map(|k| k.table).collect();
        Ok(tables.into_iter().collect())
    }

    /// Streams of one table, sorted by device.
    pub async fn streams(&self, table: &str) -> Result<Vec<StreamKey>, StoreError> {
        Ok(self
            .backend
            .streams()
            .await?
            .into_iter()
            .filter(|k| k.table == table)
            .collect())
    }

    /// Streams a device has written to, sorted by table.
    pub async fn device_streams(&self, device_id: &str) -> Result<Vec<StreamKey>, StoreError> {
        Ok(self
            .backend
            .streams()
            .await?
            .into_iter()
            .filter(|k| k.device_id == device_id)
            .collect())
    }

    pub async fn footprint_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.backend.footprint_bytes().await?)
    }

    /// Oldest records of one table still pending for `pair`.
    pub async fn pending_for_pair(
        &self,
        pair: &DevicePair,
        table: &str,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let key = StreamKey::new(&pair.source, table);
        let pending = self
            .scan_filtered(&key, TimeRange::all(), None, limit, |r| r.is_pending_for(pair))
            .await?;
        pending.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Ids that exhausted their retries for `pair`, oldest first.
    pub async fn failed_terminal_for_pair(&self, pair: &DevicePair) -> Result<Vec<RecordId>, StoreError> {
        let mut failed = Vec::new();
        for key in self.device_streams(&pair.source).await? {
            let found = self
                .scan_filtered(&key, TimeRange::all(), None, usize::MAX, |r| r.failed_to.contains(pair))
                .await?;
            failed.extend(found);
        }
        failed.sort_by_key(ScanPosition::of);
        Ok(failed.into_iter().map(|r| r.id).collect())
    }

    /// A device's records across all tables, in timestamp order.
    pub async fn timeline(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<TimelineItem>, StoreError> {
        let _timer = LatencyTimer::new("timeline");
        let range = TimeRange { since, until };
        let mut records = Vec::new();
        for key in self.device_streams(device_id).await? {
            records.extend(self.scan_filtered(&key, range, None, usize::MAX, |_| true).await?);
        }
        records.sort_by_key(ScanPosition::of);
        records
            .into_iter()
            .map(|r| self.decode(r).map(TimelineItem::from))
            .collect()
    }
}
