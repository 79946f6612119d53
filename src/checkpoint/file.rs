//! File-backed checkpoint store
//!
//! Keeps every job in one JSON document and rewrites it atomically
//! (temp file + rename) on each change. The in-memory copy is only
//! replaced after the write succeeds, so a failed write never leaves the
//! process believing in progress that is not on disk.

use super::store::CheckpointStore;
use super::types::{CheckpointUpdate, SyncCheckpoint};
use crate::error::{Error, Result};
use crate::types::DateRange;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    jobs: BTreeMap<String, SyncCheckpoint>,
}

/// Checkpoint store persisted to a JSON file
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    /// Path to the checkpoint file
    path: PathBuf,
    /// Last state known to be on disk
    state: Arc<Mutex<CheckpointFile>>,
}

impl FileCheckpointStore {
    /// Open a store, loading existing checkpoints if the file is present
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                Error::checkpoint(format!("Failed to read checkpoint file: {e}"))
            })?;
            if contents.trim().is_empty() {
                CheckpointFile::default()
            } else {
                serde_json::from_str(&contents).map_err(|e| {
                    Error::checkpoint(format!("Failed to parse checkpoint file: {e}"))
                })?
            }
        } else {
            CheckpointFile::default()
        };

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Get the checkpoint file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &CheckpointFile) -> Result<()> {
        let contents = serde_json::to_string_pretty(document)
            .map_err(|e| Error::checkpoint(format!("Failed to serialize checkpoints: {e}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::checkpoint(format!("Failed to create checkpoint directory: {e}"))
                })?;
            }
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| Error::checkpoint(format!("Failed to write checkpoint file: {e}")))?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::checkpoint(format!("Failed to rename checkpoint file: {e}")))?;

        Ok(())
    }

    /// Apply `change` to a copy, persist it, then publish it
    async fn mutate<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut CheckpointFile) -> bool + Send,
    {
        let mut state = self.state.lock().await;
        let mut draft = state.clone();
        if !change(&mut draft) {
            return Ok(());
        }
        self.persist(&draft).await?;
        *state = draft;
        Ok(())
    }
}

fn allocate_id(document: &mut CheckpointFile) -> u64 {
    document.next_id += 1;
    document.next_id
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get_state(&self, job_name: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.state.lock().await.jobs.get(job_name).cloned())
    }

    async fn ensure_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        let now = Utc::now();
        self.mutate(|doc| {
            if let Some(existing) = doc.jobs.get_mut(job_name) {
                return existing.fill_missing_range(range, now);
            }
            let id = allocate_id(doc);
            doc.jobs.insert(
                job_name.to_string(),
                SyncCheckpoint::new(id, job_name, Some(range), now),
            );
            true
        })
        .await
    }

    async fn update_checkpoint(&self, job_name: &str, update: &CheckpointUpdate) -> Result<()> {
        let now = Utc::now();
        self.mutate(|doc| {
            if !doc.jobs.contains_key(job_name) {
                let id = allocate_id(doc);
                doc.jobs.insert(
                    job_name.to_string(),
                    SyncCheckpoint::new(id, job_name, None, now),
                );
            }
            if let Some(row) = doc.jobs.get_mut(job_name) {
                row.apply(update, now);
            }
            true
        })
        .await
    }

    async fn reset_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        let now = Utc::now();
        self.mutate(|doc| {
            if let Some(row) = doc.jobs.get_mut(job_name) {
                row.reset(range, now);
            } else {
                let id = allocate_id(doc);
                doc.jobs.insert(
                    job_name.to_string(),
                    SyncCheckpoint::new(id, job_name, Some(range), now),
                );
            }
            true
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<SyncCheckpoint>> {
        let mut jobs: Vec<_> = self.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
