//! Loader module
//!
//! Where extracted chunks go before their checkpoint is written.
//!
//! # Overview
//!
//! The loader module provides:
//! - `Loader` - Contract the extraction loop hands each chunk to
//! - `MemoryLoader` - Keeps records in memory (dry runs, tests)
//! - `DuckDbStagingLoader` - Stages records into a DuckDB table
//! - `ParquetChunkLoader` - Writes one Parquet file per chunk
//!
//! Delivery is at-least-once: a resumed run may hand a loader records it has
//! already seen. Every loader keys on the record's business key so a
//! re-delivered record replaces its earlier copy.

mod duckdb;
mod memory;
mod parquet;

pub use self::duckdb::{DuckDbStagingLoader, DEFAULT_STAGING_TABLE};
pub use self::parquet::ParquetChunkLoader;
pub use memory::MemoryLoader;

use crate::decode::ExtractedRecord;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

/// Outcome of one load call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Records handed to the loader
    pub received: usize,
    /// Records written after collapsing duplicate keys
    pub written: usize,
    /// Records dropped because a later record in the same chunk had the same key
    pub duplicates: usize,
    /// Where the data went (file path, table name), if meaningful
    pub location: Option<String>,
}

/// Destination for extracted chunks.
///
/// `load` must either persist the whole chunk or fail; the engine only
/// checkpoints after it returns `Ok`.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Persist a chunk of records
    async fn load(&self, records: &[ExtractedRecord]) -> Result<LoadReport>;

    /// Loader name for logs
    fn name(&self) -> &'static str;
}

/// Collapse records sharing a business key, keeping the last one.
///
/// Output keeps the position of each key's first appearance.
pub fn dedupe_latest(records: &[ExtractedRecord]) -> Vec<&ExtractedRecord> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<&ExtractedRecord> = Vec::with_capacity(records.len());

    for record in records {
        match index.get(&record.dedupe_key()) {
            Some(&slot) => out[slot] = record,
            None => {
                index.insert(record.dedupe_key(), out.len());
                out.push(record);
            }
        }
    }
    out
}
