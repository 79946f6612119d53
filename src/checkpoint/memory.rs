//! In-memory checkpoint store
//!
//! Used by dry runs and tests. Nothing survives the process.

use super::store::CheckpointStore;
use super::types::{CheckpointUpdate, SyncCheckpoint};
use crate::error::Result;
use crate::types::DateRange;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    jobs: HashMap<String, SyncCheckpoint>,
}

impl Inner {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Checkpoint store backed by a shared map
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly (handy for resume scenarios)
    pub async fn insert(&self, checkpoint: SyncCheckpoint) {
        let mut inner = self.inner.write().await;
        inner.next_id = inner.next_id.max(checkpoint.id);
        inner.jobs.insert(checkpoint.job_name.clone(), checkpoint);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_state(&self, job_name: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.inner.read().await.jobs.get(job_name).cloned())
    }

    async fn ensure_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.jobs.get_mut(job_name) {
            existing.fill_missing_range(range, now);
            return Ok(());
        }
        let id = inner.allocate_id();
        inner.jobs.insert(
            job_name.to_string(),
            SyncCheckpoint::new(id, job_name, Some(range), now),
        );
        Ok(())
    }

    async fn update_checkpoint(&self, job_name: &str, update: &CheckpointUpdate) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        if !inner.jobs.contains_key(job_name) {
            let id = inner.allocate_id();
            inner.jobs.insert(
                job_name.to_string(),
                SyncCheckpoint::new(id, job_name, None, now),
            );
        }
        if let Some(row) = inner.jobs.get_mut(job_name) {
            row.apply(update, now);
        }
        Ok(())
    }

    async fn reset_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.jobs.get_mut(job_name) {
            row.reset(range, now);
            return Ok(());
        }
        let id = inner.allocate_id();
        inner.jobs.insert(
            job_name.to_string(),
            SyncCheckpoint::new(id, job_name, Some(range), now),
        );
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<SyncCheckpoint>> {
        let mut jobs: Vec<_> = self.inner.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
