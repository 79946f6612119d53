//! Run metrics
//!
//! The engine reports every completed chunk and every retry decision to a
//! [`MetricsSink`]. Events go to the log as well, so a [`NoopSink`] still
//! leaves an operational trail.

use crate::types::Cursor;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Emitted after a chunk has been loaded and checkpointed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEvent {
    /// Job the chunk belongs to
    pub job_name: String,
    /// 1-based chunk number within the job
    pub chunk_number: u64,
    /// Wall time spent fetching and loading the chunk
    pub duration_seconds: f64,
    /// Records in the chunk
    pub row_count: u64,
    /// HTTP calls made for the chunk, retries included
    pub api_calls: u64,
    /// Cursor checkpointed after the chunk
    pub cursor: Option<Cursor>,
    /// Retry decisions taken during the chunk
    pub retries: u32,
}

/// Emitted whenever the engine decides to wait and retry a page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryEvent {
    /// Job being synced
    pub job_name: String,
    /// 1-based consecutive failure count for this kind of failure
    pub attempt: u32,
    /// How long the engine will sleep
    pub wait_seconds: f64,
    /// Failure label (`rate_limited`, `transient`)
    pub reason: String,
    /// Human-readable failure detail
    pub detail: String,
}

/// Receiver of run metrics
pub trait MetricsSink: Send + Sync {
    /// A chunk was checkpointed
    fn chunk_completed(&self, event: &ChunkEvent);

    /// A page fetch will be retried
    fn retry_scheduled(&self, event: &RetryEvent);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn chunk_completed(&self, _event: &ChunkEvent) {}

    fn retry_scheduled(&self, _event: &RetryEvent) {}
}

/// Writes events as structured log lines under the `salesync::metrics` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn chunk_completed(&self, event: &ChunkEvent) {
        info!(
            target: "salesync::metrics",
            job = %event.job_name,
            chunk = event.chunk_number,
            duration_seconds = event.duration_seconds,
            rows = event.row_count,
            api_calls = event.api_calls,
            cursor = event.cursor.as_ref().map_or("", Cursor::as_str),
            retries = event.retries,
            "chunk_completed"
        );
    }

    fn retry_scheduled(&self, event: &RetryEvent) {
        warn!(
            target: "salesync::metrics",
            job = %event.job_name,
            attempt = event.attempt,
            wait_seconds = event.wait_seconds,
            reason = %event.reason,
            detail = %event.detail,
            "retry_scheduled"
        );
    }
}

#[derive(Debug, Default)]
struct Recorded {
    chunks: Vec<ChunkEvent>,
    retries: Vec<RetryEvent>,
}

/// Keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    recorded: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk events received so far
    pub fn chunks(&self) -> Vec<ChunkEvent> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .chunks
            .clone()
    }

    /// Retry events received so far
    pub fn retries(&self) -> Vec<RetryEvent> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retries
            .clone()
    }
}

impl MetricsSink for MemorySink {
    fn chunk_completed(&self, event: &ChunkEvent) {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .chunks
            .push(event.clone());
    }

    fn retry_scheduled(&self, event: &RetryEvent) {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retries
            .push(event.clone());
    }
}
