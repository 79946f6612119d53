//! DuckDB-backed checkpoint store
//!
//! One row per job in `sync_checkpoints`, ids drawn from a sequence so the
//! most recent row is well-defined. Chunk metrics and the date window are
//! merged with `COALESCE` in SQL; timestamps are stored as RFC 3339 text.

use super::store::CheckpointStore;
use super::types::{CheckpointUpdate, SyncCheckpoint, SyncStatus};
use crate::error::{Error, Result};
use crate::types::{Cursor, DateRange};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use duckdb::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Idempotent DDL for the checkpoint table.
const CREATE_TABLES: &str = r"
CREATE SEQUENCE IF NOT EXISTS sync_checkpoints_id_seq START 1;

CREATE TABLE IF NOT EXISTS sync_checkpoints (
    id BIGINT PRIMARY KEY DEFAULT nextval('sync_checkpoints_id_seq'),
    job_name VARCHAR NOT NULL UNIQUE,
    cursor_value VARCHAR,
    status VARCHAR NOT NULL,
    records_extracted BIGINT NOT NULL DEFAULT 0,
    date_range_start VARCHAR,
    date_range_end VARCHAR,
    last_chunk_number BIGINT,
    last_chunk_row_count BIGINT,
    last_chunk_duration_seconds DOUBLE,
    last_chunk_completed_at VARCHAR,
    error_message VARCHAR,
    created_at VARCHAR NOT NULL,
    updated_at VARCHAR NOT NULL,
    completed_at VARCHAR
);
";

const SELECT_COLUMNS: &str = "id, job_name, cursor_value, status, records_extracted, \
     date_range_start, date_range_end, last_chunk_number, last_chunk_row_count, \
     last_chunk_duration_seconds, last_chunk_completed_at, error_message, \
     created_at, updated_at, completed_at";

const UPDATE_CHECKPOINT: &str = r"
UPDATE sync_checkpoints SET
    cursor_value = $1,
    records_extracted = $2,
    status = $3,
    date_range_start = COALESCE($4, date_range_start),
    date_range_end = COALESCE($5, date_range_end),
    last_chunk_number = COALESCE($6, last_chunk_number),
    last_chunk_row_count = COALESCE($7, last_chunk_row_count),
    last_chunk_duration_seconds = COALESCE($8, last_chunk_duration_seconds),
    last_chunk_completed_at = COALESCE($9, last_chunk_completed_at),
    error_message = $10,
    updated_at = $11,
    completed_at = CASE
        WHEN $12 AND (status <> $3 OR completed_at IS NULL) THEN $11
        WHEN $12 THEN completed_at
        ELSE NULL
    END
WHERE job_name = $13
";

/// Checkpoint store persisted in a DuckDB database file.
///
/// Uses a single `Mutex<Connection>`, which also serializes writes.
pub struct DuckDbCheckpointStore {
    conn: Mutex<Connection>,
}

impl DuckDbCheckpointStore {
    /// Open or create a DuckDB checkpoint database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::checkpoint(format!("Failed to open DuckDB database: {e}")))?;
        Self::from_connection(conn)
    }

    /// In-memory database (for tests)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::checkpoint(format!("Failed to create DuckDB connection: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| Error::checkpoint(format!("Failed to create checkpoint table: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::checkpoint("Checkpoint connection lock poisoned"))
    }

    fn select_job(conn: &Connection, job_name: &str) -> Result<Option<SyncCheckpoint>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sync_checkpoints WHERE job_name = ? ORDER BY id DESC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        match stmt.query_row(params![job_name], RawRow::from_row) {
            Ok(raw) => raw.into_checkpoint().map(Some),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn insert_ready(
        conn: &Connection,
        job_name: &str,
        range: Option<&DateRange>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = now.to_rfc3339();
        conn.execute(
            "INSERT INTO sync_checkpoints \
             (job_name, status, records_extracted, date_range_start, date_range_end, created_at, updated_at) \
             VALUES (?, ?, 0, ?, ?, ?, ?)",
            params![
                job_name,
                SyncStatus::Ready.as_str(),
                range.map(|r| r.start.to_string()),
                range.map(|r| r.end.to_string()),
                now,
                now,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for DuckDbCheckpointStore {
    async fn get_state(&self, job_name: &str) -> Result<Option<SyncCheckpoint>> {
        let conn = self.lock_conn()?;
        Self::select_job(&conn, job_name)
    }

    async fn ensure_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        if Self::select_job(&conn, job_name)?.is_none() {
            return Self::insert_ready(&conn, job_name, Some(range), now);
        }
        conn.execute(
            "UPDATE sync_checkpoints SET \
                 date_range_start = COALESCE(date_range_start, ?), \
                 date_range_end = COALESCE(date_range_end, ?) \
             WHERE job_name = ? AND (date_range_start IS NULL OR date_range_end IS NULL)",
            params![range.start.to_string(), range.end.to_string(), job_name],
        )?;
        Ok(())
    }

    async fn update_checkpoint(&self, job_name: &str, update: &CheckpointUpdate) -> Result<()> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        if Self::select_job(&conn, job_name)?.is_none() {
            Self::insert_ready(&conn, job_name, None, now)?;
        }

        let error_message = if update.status == SyncStatus::Error {
            update.error_message.clone()
        } else {
            None
        };
        let chunk = update.chunk.as_ref();

        let changed = conn.execute(
            UPDATE_CHECKPOINT,
            params![
                update.cursor.as_ref().map(|c| c.as_str().to_string()),
                to_i64(update.records_extracted)?,
                update.status.as_str(),
                update.date_range.map(|r| r.start.to_string()),
                update.date_range.map(|r| r.end.to_string()),
                chunk.map(|c| to_i64(c.chunk_number)).transpose()?,
                chunk.map(|c| to_i64(c.row_count)).transpose()?,
                chunk.map(|c| c.duration_seconds),
                chunk.map(|c| c.completed_at.to_rfc3339()),
                error_message,
                now.to_rfc3339(),
                update.status.is_terminal(),
                job_name,
            ],
        )?;

        if changed == 0 {
            return Err(Error::checkpoint(format!(
                "Checkpoint update for '{job_name}' touched no rows"
            )));
        }
        Ok(())
    }

    async fn reset_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        if Self::select_job(&conn, job_name)?.is_none() {
            return Self::insert_ready(&conn, job_name, Some(range), now);
        }
        conn.execute(
            "UPDATE sync_checkpoints SET \
                 cursor_value = NULL, status = ?, records_extracted = 0, \
                 date_range_start = ?, date_range_end = ?, \
                 last_chunk_number = NULL, last_chunk_row_count = NULL, \
                 last_chunk_duration_seconds = NULL, last_chunk_completed_at = NULL, \
                 error_message = NULL, completed_at = NULL, updated_at = ? \
             WHERE job_name = ?",
            params![
                SyncStatus::Ready.as_str(),
                range.start.to_string(),
                range.end.to_string(),
                now.to_rfc3339(),
                job_name,
            ],
        )?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<SyncCheckpoint>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_checkpoints ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_checkpoint).collect()
    }

    fn backend_name(&self) -> &'static str {
        "duckdb"
    }
}

impl std::fmt::Debug for DuckDbCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbCheckpointStore").finish_non_exhaustive()
    }
}

/// Column values as DuckDB hands them back
struct RawRow {
    id: i64,
    job_name: String,
    cursor: Option<String>,
    status: String,
    records_extracted: i64,
    date_range_start: Option<String>,
    date_range_end: Option<String>,
    last_chunk_number: Option<i64>,
    last_chunk_row_count: Option<i64>,
    last_chunk_duration_seconds: Option<f64>,
    last_chunk_completed_at: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_name: row.get(1)?,
            cursor: row.get(2)?,
            status: row.get(3)?,
            records_extracted: row.get(4)?,
            date_range_start: row.get(5)?,
            date_range_end: row.get(6)?,
            last_chunk_number: row.get(7)?,
            last_chunk_row_count: row.get(8)?,
            last_chunk_duration_seconds: row.get(9)?,
            last_chunk_completed_at: row.get(10)?,
            error_message: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_checkpoint(self) -> Result<SyncCheckpoint> {
        Ok(SyncCheckpoint {
            id: self.id.max(0) as u64,
            job_name: self.job_name,
            cursor: self.cursor.map(Cursor::from),
            status: self.status.parse()?,
            records_extracted: self.records_extracted.max(0) as u64,
            date_range_start: self.date_range_start.as_deref().map(parse_date).transpose()?,
            date_range_end: self.date_range_end.as_deref().map(parse_date).transpose()?,
            last_chunk_number: self.last_chunk_number.map(|n| n.max(0) as u64),
            last_chunk_row_count: self.last_chunk_row_count.map(|n| n.max(0) as u64),
            last_chunk_duration_seconds: self.last_chunk_duration_seconds,
            last_chunk_completed_at: self
                .last_chunk_completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::checkpoint(format!("Counter {value} overflows BIGINT")))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    raw.parse()
        .map_err(|e| Error::checkpoint(format!("Invalid stored date '{raw}': {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::checkpoint(format!("Invalid stored timestamp '{raw}': {e}")))
}
