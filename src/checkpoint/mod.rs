//! Checkpoint module
//!
//! Durable per-job sync progress, the thing that makes multi-month
//! backfills resumable.
//!
//! # Overview
//!
//! The checkpoint module provides:
//! - `SyncCheckpoint` - One row of progress per named job
//! - `CheckpointStore` - Storage contract used by the extraction loop
//! - `InMemoryCheckpointStore`, `FileCheckpointStore`, `DuckDbCheckpointStore` - Backends

mod duckdb;
mod file;
mod memory;
mod store;
mod types;

pub use self::duckdb::DuckDbCheckpointStore;
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use store::CheckpointStore;
pub use types::{ChunkMetrics, CheckpointUpdate, SyncCheckpoint, SyncStatus};
