// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite record backend.
//!
//! Schema:
//! ```sql
//! CREATE TABLE records (
//!   id TEXT PRIMARY KEY,       -- UUID v7, hyphenated
//!   device_id TEXT NOT NULL,
//!   table_name TEXT NOT NULL,
//!   ts_micros INTEGER NOT NULL,
//!   note_id TEXT,              -- set for note records, kept across compression
//!   size_bytes INTEGER NOT NULL,
//!   synced INTEGER NOT NULL,   -- acknowledged by any pair (eviction order)
//!   body TEXT NOT NULL,        -- full record as JSON
//!   payload_hash TEXT NOT NULL -- sha256(body), verified on every read
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! TEXT columns may come back as bytes through the `Any` driver, so reads
//! try `String` first and fall back to `Vec<u8>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{RecordBackend, ScanPosition, StorageError, TimeRange};
use crate::record::{KnownEntity, NoteReference, Record, RecordId, StreamKey};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        ts_micros INTEGER NOT NULL,
        note_id TEXT,
        size_bytes INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        payload_hash TEXT NOT NULL
    )
    "#,
    // Not unique: a derived record shares its first source's timestamp
    // while the swap is in progress. Dedup is enforced by the store.
    "CREATE INDEX IF NOT EXISTS idx_records_stream ON records (device_id, table_name, ts_micros)",
    "CREATE INDEX IF NOT EXISTS idx_records_note ON records (note_id)",
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        entity_id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS note_references (
        note_id TEXT NOT NULL,
        reference_type TEXT NOT NULL,
        reference_id TEXT NOT NULL,
        created_micros INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (note_id, reference_type, reference_id)
    )
    "#,
];

const UPSERT_RECORD: &str = "INSERT INTO records (id, device_id, table_name, ts_micros, note_id, size_bytes, synced, body, payload_hash) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT(id) DO UPDATE SET \
        device_id = excluded.device_id, \
        table_name = excluded.table_name, \
        ts_micros = excluded.ts_micros, \
        note_id = COALESCE(excluded.note_id, records.note_id), \
        size_bytes = excluded.size_bytes, \
        synced = excluded.synced, \
        body = excluded.body, \
        payload_hash = excluded.payload_hash";

const RECORD_COLUMNS: &str = "id, body, payload_hash";

fn backend_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn hash_body(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Read a TEXT column as String (SQLite) or bytes (other Any drivers)
fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column).or_else(|_| {
        row.try_get::<Vec<u8>, _>(column)
            .map_err(backend_err)
            .and_then(|bytes| String::from_utf8(bytes).map_err(backend_err))
    })
}

fn decode_record(row: &AnyRow) -> Result<Record, StorageError> {
    let id = text_column(row, "id")?;
    let body = text_column(row, "body")?;
    let expected = text_column(row, "payload_hash")?;
    let actual = hash_body(&body);
    if actual != expected {
        crate::metrics::record_corruption(&id);
        return Err(StorageError::Corruption { id, expected, actual });
    }
    Ok(serde_json::from_str(&body)?)
}

/// Column values for one record row
struct RecordRow {
    id: String,
    device_id: String,
    table_name: String,
    ts_micros: i64,
    note_id: Option<String>,
    size_bytes: i64,
    synced: i64,
    body: String,
    payload_hash: String,
}

impl RecordRow {
    fn from_record(record: &Record) -> Result<Self, StorageError> {
        let body = serde_json::to_string(record)?;
        let payload_hash = hash_body(&body);
        Ok(Self {
            id: record.id.to_string(),
            device_id: record.device_id.clone(),
            table_name: record.table.clone(),
            ts_micros: record.timestamp.timestamp_micros(),
            note_id: record.note_id().map(str::to_string),
            size_bytes: i64::try_from(record.size_bytes()).unwrap_or(i64::MAX),
            synced: i64::from(record.is_synced_anywhere()),
            body,
            payload_hash,
        })
    }

    fn bind<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        query
            .bind(&self.id)
            .bind(&self.device_id)
            .bind(&self.table_name)
            .bind(self.ts_micros)
            .bind(&self.note_id)
            .bind(self.size_bytes)
            .bind(self.synced)
            .bind(&self.body)
            .bind(&self.payload_hash)
    }
}

pub struct SqlBackend {
    pool: AnyPool,
}

impl SqlBackend {
    /// Open (creating if needed) with startup-mode retry (fails fast if config is wrong).
    ///
    /// `connection_string` is a sqlx SQLite URL, e.g. `sqlite://loom.db?mode=rwc`.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        if !connection_string.starts_with("sqlite:") {
            return Err(StorageError::Backend(format!(
                "unsupported connection string `{connection_string}`, expected sqlite:"
            )));
        }

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            // SQLite allows one writer; a single connection keeps
            // transactions from tripping over SQLITE_BUSY.
            AnyPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(backend_err)
        })
        .await?;

        let backend = Self { pool };
        backend.enable_wal_mode().await?;
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Open a database file, creating it when missing.
    pub async fn open_file(path: &std::path::Path) -> Result<Self, StorageError> {
        Self::new(&format!("sqlite://{}?mode=rwc", path.display())).await
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {e}")))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {e}")))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)
            })
            .await?;
        }
        Ok(())
    }

    async fn write_records(
        &self,
        originals: &[RecordId],
        records: &[Record],
    ) -> Result<(), StorageError> {
        let rows = records
            .iter()
            .map(RecordRow::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = originals.iter().map(ToString::to_string).collect();

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        for row in &rows {
            row.bind(sqlx::query(UPSERT_RECORD))
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }
        for id in &ids {
            sqlx::query("DELETE FROM records WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }
        tx.commit().await.map_err(backend_err)
    }
}

#[async_trait]
impl RecordBackend for SqlBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let id = id.to_string();
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?");
        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn find_by_key(
        &self,
        key: &StreamKey,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Record>, StorageError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE device_id = ? AND table_name = ? AND ts_micros = ? ORDER BY id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(&key.device_id)
            .bind(&key.table)
            .bind(timestamp.timestamp_micros())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn put(&self, record: &Record) -> Result<(), StorageError> {
        let row = RecordRow::from_record(record)?;
        retry("sql_put", &RetryConfig::query(), || async {
            row.bind(sqlx::query(UPSERT_RECORD))
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            Ok(())
        })
        .await
    }

    async fn put_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        self.write_records(&[], records).await
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let mut removed = 0usize;
        for id in ids {
            let result = sqlx::query("DELETE FROM records WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(backend_err)?;
        Ok(removed)
    }

    async fn swap(&self, originals: &[RecordId], reduced: &[Record]) -> Result<(), StorageError> {
        self.write_records(originals, reduced).await
    }

    async fn scan(
        &self,
        key: &StreamKey,
        range: TimeRange,
        after: Option<ScanPosition>,
        limit: usize,
    ) -> Result<Vec<Record>, StorageError> {
        let since = range.since.map_or(i64::MIN, |t| t.timestamp_micros());
        let until = range.until.map_or(i64::MAX, |t| t.timestamp_micros());
        let (after_ts, after_id) = match after {
            Some(pos) => (pos.timestamp.timestamp_micros(), pos.id.to_string()),
            None => (i64::MIN, String::new()),
        };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE device_id = ? AND table_name = ? AND ts_micros >= ? AND ts_micros < ? \
               AND (ts_micros > ? OR (ts_micros = ? AND id > ?)) \
             ORDER BY ts_micros, id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(&key.device_id)
            .bind(&key.table)
            .bind(since)
            .bind(until)
            .bind(after_ts)
            .bind(after_ts)
            .bind(&after_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(decode_record).collect()
    }

    async fn streams(&self) -> Result<Vec<StreamKey>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT device_id, table_name FROM records ORDER BY device_id, table_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|row| Ok(StreamKey::new(text_column(row, "device_id")?, text_column(row, "table_name")?)))
            .collect()
    }

    async fn footprint_bytes(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COALESCE(SUM(size_bytes), 0) AS total FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let total: i64 = row.try_get("total").map_err(backend_err)?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let count: i64 = row.try_get("cnt").map_err(backend_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn find_note(&self, note_id: &str) -> Result<Option<RecordId>, StorageError> {
        let row = sqlx::query("SELECT id FROM records WHERE note_id = ? LIMIT 1")
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        match row {
            Some(row) => {
                let id = text_column(&row, "id")?;
                RecordId::parse(&id).map(Some).map_err(backend_err)
            }
            None => Ok(None),
        }
    }

    async fn put_entity(&self, entity: &KnownEntity) -> Result<(), StorageError> {
        let body = serde_json::to_string(entity)?;
        sqlx::query(
            "INSERT INTO entities (entity_id, body) VALUES (?, ?) \
             ON CONFLICT(entity_id) DO UPDATE SET body = excluded.body",
        )
        .bind(&entity.entity_id)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<KnownEntity>, StorageError> {
        let row = sqlx::query("SELECT body FROM entities WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&text_column(&row, "body")?)?)),
            None => Ok(None),
        }
    }

    async fn put_reference(&self, reference: &NoteReference) -> Result<bool, StorageError> {
        let body = serde_json::to_string(reference)?;
        let result = sqlx::query(
            "INSERT INTO note_references (note_id, reference_type, reference_id, created_micros, body) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(&reference.note_id)
        .bind(&reference.reference_type)
        .bind(&reference.reference_id)
        .bind(reference.created_at.timestamp_micros())
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn references_for_note(&self, note_id: &str) -> Result<Vec<NoteReference>, StorageError> {
        let rows = sqlx::query(
            "SELECT body FROM note_references WHERE note_id = ? ORDER BY created_micros, reference_id",
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|row| Ok(serde_json::from_str(&text_column(row, "body")?)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sensor::GpsFix;
    use crate::record::{Payload, TypedRecord};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn gps(minutes: i64) -> Record {
        TypedRecord::new("gps", "phone", t0() + Duration::minutes(minutes), Payload::Gps(GpsFix::new(1.0, 2.0)))
            .unwrap()
            .into_record(RecordId::new(), t0())
    }

    async fn open(dir: &tempfile::TempDir) -> SqlBackend {
        SqlBackend::open_file(&dir.path().join("records.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_scan() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let recs: Vec<Record> = (0..5).map(gps).collect();
        backend.put_batch(&recs).await.unwrap();

        assert_eq!(backend.get(recs[2].id).await.unwrap(), Some(recs[2].clone()));
        assert_eq!(backend.count().await.unwrap(), 5);

        let key = StreamKey::new("phone", "gps");
        let first = backend.scan(&key, TimeRange::all(), None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = backend
            .scan(&key, TimeRange::all(), Some(ScanPosition::of(&first[1])), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].id, recs[2].id);
    }

    #[tokio::test]
    async fn test_tampered_body_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let rec = gps(0);
        backend.put(&rec).await.unwrap();

        sqlx::query("UPDATE records SET body = REPLACE(body, 'gps', 'gpz') WHERE id = ?")
            .bind(rec.id.to_string())
            .execute(&backend.pool())
            .await
            .unwrap();

        let err = backend.get(rec.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_swap_is_atomic_unit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let recs: Vec<Record> = (0..4).map(gps).collect();
        backend.put_batch(&recs).await.unwrap();

        let reduced = gps(0);
        let ids: Vec<RecordId> = recs.iter().map(|r| r.id).collect();
        backend.swap(&ids, std::slice::from_ref(&reduced)).await.unwrap();
        assert_eq!(backend.count().await.unwrap(), 1);
        let found = backend.find_by_key(&reduced.key(), reduced.timestamp).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(reduced.id));
    }

    #[tokio::test]
    async fn test_footprint_matches_records() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(&dir).await;
        let rec = gps(0);
        backend.put(&rec).await.unwrap();
        assert_eq!(backend.footprint_bytes().await.unwrap(), rec.size_bytes() as u64);
    }
}
