//! Checkpoint types for tracking sync progress
//!
//! These types are serialized to JSON (file backend) or mapped onto the
//! `sync_checkpoints` table (DuckDB backend) and persisted between runs.

use crate::error::{Error, Result};
use crate::types::{Cursor, DateRange};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Created, nothing extracted yet
    #[default]
    Ready,
    /// A run is in progress (or died without reaching a terminal state)
    Running,
    /// Last run finished by exhaustion or early exit
    Completed,
    /// Last run aborted; `error_message` says why
    Error,
}

impl SyncStatus {
    /// Storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Ready => "READY",
            SyncStatus::Running => "RUNNING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Error => "ERROR",
        }
    }

    /// Completed and Error are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncStatus::Completed | SyncStatus::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "READY" => Ok(SyncStatus::Ready),
            "RUNNING" => Ok(SyncStatus::Running),
            "COMPLETED" => Ok(SyncStatus::Completed),
            "ERROR" => Ok(SyncStatus::Error),
            other => Err(Error::checkpoint(format!("Unknown sync status '{other}'"))),
        }
    }
}

/// Durable progress record for one named job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Internal monotonic id; higher means more recently created
    pub id: u64,
    /// Job identity
    pub job_name: String,
    /// Last checkpointed API cursor (None = start from the beginning)
    #[serde(default)]
    pub cursor: Option<Cursor>,
    /// Current status
    #[serde(default)]
    pub status: SyncStatus,
    /// Cumulative records handed to the loader across all chunks
    #[serde(default)]
    pub records_extracted: u64,
    /// First day of the target window
    #[serde(default)]
    pub date_range_start: Option<NaiveDate>,
    /// Last day of the target window
    #[serde(default)]
    pub date_range_end: Option<NaiveDate>,
    /// Number of the most recently completed chunk
    #[serde(default)]
    pub last_chunk_number: Option<u64>,
    /// Rows in the most recently completed chunk
    #[serde(default)]
    pub last_chunk_row_count: Option<u64>,
    /// Wall time of the most recently completed chunk
    #[serde(default)]
    pub last_chunk_duration_seconds: Option<f64>,
    /// When the most recently completed chunk was checkpointed
    #[serde(default)]
    pub last_chunk_completed_at: Option<DateTime<Utc>>,
    /// Last fatal error, only set while status is Error
    #[serde(default)]
    pub error_message: Option<String>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
    /// Stamped when the job enters Completed or Error
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    /// Fresh READY row
    pub fn new(
        id: u64,
        job_name: impl Into<String>,
        range: Option<&DateRange>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            cursor: None,
            status: SyncStatus::Ready,
            records_extracted: 0,
            date_range_start: range.map(|r| r.start),
            date_range_end: range.map(|r| r.end),
            last_chunk_number: None,
            last_chunk_row_count: None,
            last_chunk_duration_seconds: None,
            last_chunk_completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// The stored window, when both ends are set
    pub fn date_range(&self) -> Option<DateRange> {
        match (self.date_range_start, self.date_range_end) {
            (Some(start), Some(end)) => Some(DateRange::new(start, end)),
            _ => None,
        }
    }

    /// `ensure_job` semantics: only fill window ends that are still unset
    pub fn fill_missing_range(&mut self, range: &DateRange, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.date_range_start.is_none() {
            self.date_range_start = Some(range.start);
            changed = true;
        }
        if self.date_range_end.is_none() {
            self.date_range_end = Some(range.end);
            changed = true;
        }
        if changed {
            self.updated_at = now;
        }
        changed
    }

    /// Return the row to a fresh READY state, keeping its identity
    pub fn reset(&mut self, range: &DateRange, now: DateTime<Utc>) {
        let id = self.id;
        let created_at = self.created_at;
        *self = Self::new(id, std::mem::take(&mut self.job_name), Some(range), now);
        self.created_at = created_at;
    }

    /// `update_checkpoint` semantics.
    ///
    /// Progress fields are always overwritten; the window and chunk metrics
    /// only when the update carries them.
    pub fn apply(&mut self, update: &CheckpointUpdate, now: DateTime<Utc>) {
        let previous = self.status;

        self.cursor.clone_from(&update.cursor);
        self.records_extracted = update.records_extracted;
        self.status = update.status;

        if let Some(range) = update.date_range {
            self.date_range_start = Some(range.start);
            self.date_range_end = Some(range.end);
        }

        if let Some(chunk) = &update.chunk {
            self.last_chunk_number = Some(chunk.chunk_number);
            self.last_chunk_row_count = Some(chunk.row_count);
            self.last_chunk_duration_seconds = Some(chunk.duration_seconds);
            self.last_chunk_completed_at = Some(chunk.completed_at);
        }

        self.error_message = if update.status == SyncStatus::Error {
            update.error_message.clone()
        } else {
            None
        };

        if update.status.is_terminal() {
            if previous != update.status || self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else {
            self.completed_at = None;
        }

        self.updated_at = now;
    }
}

/// Metrics of one completed chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    /// Chunk sequence number
    pub chunk_number: u64,
    /// Rows loaded by the chunk
    pub row_count: u64,
    /// Wall time of fetch + load
    pub duration_seconds: f64,
    /// When the chunk finished loading
    pub completed_at: DateTime<Utc>,
}

/// Arguments of an `update_checkpoint` call
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointUpdate {
    /// Cursor to persist (always written)
    pub cursor: Option<Cursor>,
    /// Cumulative record count (always written)
    pub records_extracted: u64,
    /// New status (always written)
    pub status: SyncStatus,
    /// Window to store; None keeps the stored one
    pub date_range: Option<DateRange>,
    /// Error text, kept only for Error status
    pub error_message: Option<String>,
    /// Chunk metrics; None keeps the stored ones
    pub chunk: Option<ChunkMetrics>,
}

impl CheckpointUpdate {
    /// Create an update carrying only the progress fields
    pub fn new(cursor: Option<Cursor>, records_extracted: u64, status: SyncStatus) -> Self {
        Self {
            cursor,
            records_extracted,
            status,
            date_range: None,
            error_message: None,
            chunk: None,
        }
    }

    /// Attach chunk metrics
    #[must_use]
    pub fn with_chunk(mut self, chunk: ChunkMetrics) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Attach a date window
    #[must_use]
    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    /// Attach an error message
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
