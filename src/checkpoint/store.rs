//! Checkpoint store trait definition.
//!
//! [`CheckpointStore`] is the storage contract the extraction loop talks to.
//! Backends decide where rows live; the merge rules live in
//! [`SyncCheckpoint::apply`](super::SyncCheckpoint::apply) so every backend
//! agrees on them.

use super::types::{CheckpointUpdate, SyncCheckpoint};
use crate::error::Result;
use crate::types::DateRange;
use async_trait::async_trait;

/// Storage contract for per-job sync progress.
///
/// Implementations must serialize writes for a given job and be usable
/// behind `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a job.
    ///
    /// Returns `Ok(None)` when the job has never been seen.
    async fn get_state(&self, job_name: &str) -> Result<Option<SyncCheckpoint>>;

    /// Insert a READY row if the job is unknown; otherwise only fill in
    /// window ends that are still unset. Safe to call on every run.
    async fn ensure_job(&self, job_name: &str, range: &DateRange) -> Result<()>;

    /// Upsert progress. Cursor, count and status are always written; the
    /// window and chunk metrics only when present in `update`.
    async fn update_checkpoint(&self, job_name: &str, update: &CheckpointUpdate) -> Result<()>;

    /// Put the job back to a fresh READY row covering `range`
    /// (cursor and counters cleared).
    async fn reset_job(&self, job_name: &str, range: &DateRange) -> Result<()>;

    /// All known jobs, oldest first
    async fn list_jobs(&self) -> Result<Vec<SyncCheckpoint>>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}
