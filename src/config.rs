//! Pipeline configuration
//!
//! One YAML file describes a sync job end to end: what window to extract,
//! how to talk to the API, how to size chunks and retry, and where
//! checkpoints and records go.
//!
//! ```yaml
//! job:
//!   job_name: pos_sales
//!   start_date: 2018-10-01
//!   end_date: 2018-12-31
//! api:
//!   base_url: https://api.example.com/v2/
//!   api_key_env: SALES_API_KEY
//! chunking:
//!   min_pages: 2
//!   max_pages: 20
//! checkpoint:
//!   backend: duckdb
//!   path: state/salesync.duckdb
//! loader:
//!   backend: parquet
//!   dir: out/sales
//! ```

use crate::checkpoint::{
    CheckpointStore, DuckDbCheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
use crate::chunk::ChunkConfig;
use crate::engine::SyncOptions;
use crate::error::{Error, Result, ResultExt};
use crate::http::ApiConfig;
use crate::loader::{DuckDbStagingLoader, Loader, MemoryLoader, ParquetChunkLoader};
use crate::retry::{RetryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Top-Level Pipeline Config
// ============================================================================

/// Complete pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Job identity and window
    pub job: SyncOptions,

    /// Sales API connection
    pub api: ApiConfig,

    /// Adaptive chunk sizing
    #[serde(default)]
    pub chunking: ChunkConfig,

    /// Retry and backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where progress is stored
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Where records go
    #[serde(default)]
    pub loader: LoaderConfig,
}

impl PipelineConfig {
    /// Load, resolve and validate a pipeline file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse, resolve and validate a pipeline document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.api.resolve_api_key()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could honour
    pub fn validate(&self) -> Result<()> {
        self.job.validate()?;

        if self.chunking.min_pages == 0 {
            return Err(Error::invalid_value("chunking.min_pages", "must be at least 1"));
        }
        if self.chunking.min_pages > self.chunking.max_pages {
            return Err(Error::invalid_value(
                "chunking.min_pages",
                format!(
                    "{} exceeds max_pages {}",
                    self.chunking.min_pages, self.chunking.max_pages
                ),
            ));
        }
        if self.chunking.growth_factor < 1.0 {
            return Err(Error::invalid_value("chunking.growth_factor", "must be at least 1.0"));
        }
        if !(self.chunking.shrink_factor > 0.0 && self.chunking.shrink_factor <= 1.0) {
            return Err(Error::invalid_value(
                "chunking.shrink_factor",
                "must be in (0.0, 1.0]",
            ));
        }

        if self.api.page_size == 0 {
            return Err(Error::invalid_value("api.page_size", "must be at least 1"));
        }
        self.api.endpoint_url()?;

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(Error::invalid_value(
                "retry.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }

        if let LoaderConfig::Duckdb { table, .. } = &self.loader {
            if table.trim().is_empty() {
                return Err(Error::invalid_value("loader.table", "must not be empty"));
            }
        }
        Ok(())
    }

    /// Retry policy for the configured tunables
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }
}

// ============================================================================
// Checkpoint Backend
// ============================================================================

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("salesync.duckdb")
}

/// Checkpoint store selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CheckpointConfig {
    /// Nothing survives the process
    Memory,
    /// JSON document on disk
    File {
        /// Checkpoint file
        path: PathBuf,
    },
    /// `sync_checkpoints` table in a DuckDB file
    Duckdb {
        /// Database file
        #[serde(default = "default_checkpoint_path")]
        path: PathBuf,
    },
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig::Duckdb {
            path: default_checkpoint_path(),
        }
    }
}

impl CheckpointConfig {
    /// Open the configured store
    pub fn open(&self) -> Result<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self {
            CheckpointConfig::Memory => Arc::new(InMemoryCheckpointStore::new()),
            CheckpointConfig::File { path } => Arc::new(FileCheckpointStore::open(path)?),
            CheckpointConfig::Duckdb { path } => Arc::new(DuckDbCheckpointStore::open(path)?),
        };
        Ok(store)
    }
}

// ============================================================================
// Loader Backend
// ============================================================================

fn default_staging_path() -> PathBuf {
    PathBuf::from("salesync_staging.duckdb")
}

fn default_staging_table() -> String {
    crate::loader::DEFAULT_STAGING_TABLE.to_string()
}

fn default_parquet_prefix() -> String {
    "sales".to_string()
}

/// Loader selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum LoaderConfig {
    /// Keep records in memory (dry runs)
    Memory,
    /// Stage into a DuckDB table
    Duckdb {
        /// Database file
        #[serde(default = "default_staging_path")]
        path: PathBuf,
        /// Staging table
        #[serde(default = "default_staging_table")]
        table: String,
    },
    /// One Parquet file per chunk
    Parquet {
        /// Output directory
        dir: PathBuf,
        /// File name prefix
        #[serde(default = "default_parquet_prefix")]
        prefix: String,
    },
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig::Duckdb {
            path: default_staging_path(),
            table: default_staging_table(),
        }
    }
}

impl LoaderConfig {
    /// Open the configured loader
    pub fn open(&self) -> Result<Arc<dyn Loader>> {
        let loader: Arc<dyn Loader> = match self {
            LoaderConfig::Memory => Arc::new(MemoryLoader::new()),
            LoaderConfig::Duckdb { path, table } => {
                Arc::new(DuckDbStagingLoader::open(path, table.clone())?)
            }
            LoaderConfig::Parquet { dir, prefix } => {
                Arc::new(ParquetChunkLoader::new(dir).with_prefix(prefix.clone()))
            }
        };
        Ok(loader)
    }
}
