//! DuckDB staging loader
//!
//! Stages raw sales into a table with one row per business key. Each chunk
//! is applied in a single transaction: rows with incoming keys are deleted,
//! then the chunk is inserted. Replaying a chunk therefore leaves the table
//! unchanged.

use super::{dedupe_latest, LoadReport, Loader};
use crate::decode::ExtractedRecord;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Default staging table
pub const DEFAULT_STAGING_TABLE: &str = "stg_sales";

/// Loader writing into a DuckDB staging table
pub struct DuckDbStagingLoader {
    conn: Mutex<Connection>,
    table: String,
}

impl DuckDbStagingLoader {
    /// Open or create a DuckDB database at `path`
    pub fn open(path: impl AsRef<Path>, table: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::loader(format!("Failed to open DuckDB database: {e}")))?;
        Self::from_connection(conn, table.into())
    }

    /// In-memory database (for tests and dry runs)
    pub fn in_memory(table: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::loader(format!("Failed to create DuckDB connection: {e}")))?;
        Self::from_connection(conn, table.into())
    }

    fn from_connection(conn: Connection, table: String) -> Result<Self> {
        if !is_identifier(&table) {
            return Err(Error::invalid_value(
                "loader.table",
                format!("'{table}' is not a plain SQL identifier"),
            ));
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                business_key VARCHAR NOT NULL,
                sold_at TIMESTAMP NOT NULL,
                payload VARCHAR NOT NULL,
                loaded_at VARCHAR NOT NULL
            );"
        ))
        .map_err(|e| Error::loader(format!("Failed to create staging table: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            table,
        })
    }

    /// Staging table name
    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::loader("Staging connection lock poisoned"))
    }

    /// Rows currently staged
    pub fn row_count(&self) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Staged business keys in ascending order
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT business_key FROM {} ORDER BY business_key",
            self.table
        ))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn write_chunk(&self, records: &[&ExtractedRecord]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let loaded_at = Utc::now().to_rfc3339();
        {
            let mut delete = tx.prepare(&format!(
                "DELETE FROM {} WHERE business_key = ?",
                self.table
            ))?;
            for record in records {
                delete.execute(params![record.dedupe_key()])?;
            }

            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} (business_key, sold_at, payload, loaded_at) \
                 VALUES (?, CAST(? AS TIMESTAMP), ?, ?)",
                self.table
            ))?;
            for record in records {
                insert.execute(params![
                    record.dedupe_key(),
                    record.timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                    record.payload.to_string(),
                    loaded_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl Loader for DuckDbStagingLoader {
    async fn load(&self, records: &[ExtractedRecord]) -> Result<LoadReport> {
        let unique = dedupe_latest(records);
        if !unique.is_empty() {
            self.write_chunk(&unique)
                .map_err(|e| Error::loader(format!("Staging into {} failed: {e}", self.table)))?;
        }
        debug!(table = %self.table, rows = unique.len(), "Staged chunk");

        Ok(LoadReport {
            received: records.len(),
            written: unique.len(),
            duplicates: records.len() - unique.len(),
            location: Some(self.table.clone()),
        })
    }

    fn name(&self) -> &'static str {
        "duckdb"
    }
}

impl std::fmt::Debug for DuckDbStagingLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbStagingLoader")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
