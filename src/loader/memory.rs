//! In-memory loader

use super::{dedupe_latest, LoadReport, Loader};
use crate::decode::ExtractedRecord;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, ExtractedRecord>,
    load_calls: usize,
    received: usize,
}

/// Loader that keeps the latest record per business key in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryLoader {
    /// Create an empty loader
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Stored records ordered by timestamp, then key
    pub fn records(&self) -> Vec<ExtractedRecord> {
        let mut records: Vec<_> = self.with_inner(|i| i.records.values().cloned().collect());
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.dedupe_key().cmp(&b.dedupe_key()))
        });
        records
    }

    /// Number of distinct business keys stored
    pub fn len(&self) -> usize {
        self.with_inner(|i| i.records.len())
    }

    /// Whether nothing has been stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `load` calls so far
    pub fn load_calls(&self) -> usize {
        self.with_inner(|i| i.load_calls)
    }

    /// Records received across all calls, duplicates included
    pub fn received(&self) -> usize {
        self.with_inner(|i| i.received)
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    async fn load(&self, records: &[ExtractedRecord]) -> Result<LoadReport> {
        let unique = dedupe_latest(records);
        let written = unique.len();

        self.with_inner(|inner| {
            inner.load_calls += 1;
            inner.received += records.len();
            for record in unique {
                inner.records.insert(record.dedupe_key(), record.clone());
            }
        });

        Ok(LoadReport {
            received: records.len(),
            written,
            duplicates: records.len() - written,
            location: None,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
