// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # salesync
//!
//! Chunked, resumable extraction of sales records from a paginated,
//! rate-limited HTTP API into a staging store.
//!
//! ## Features
//!
//! - **Durable checkpoints**: Progress per named job in DuckDB, a JSON file or memory
//! - **Adaptive chunks**: Chunk size follows observed latency and errors
//! - **Honest retries**: `Retry-After` for 429s, capped exponential backoff otherwise
//! - **Early exit**: Stops once records pass the end of the requested window
//! - **Idempotent loads**: Replayed chunks never duplicate staged rows
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use salesync::config::PipelineConfig;
//! use salesync::engine::ExtractionEngine;
//! use salesync::http::SalesApiClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> salesync::Result<()> {
//!     let config = PipelineConfig::from_file("salesync.yaml")?;
//!     let engine = ExtractionEngine::new(
//!         Arc::new(SalesApiClient::new(config.api.clone())?),
//!         config.checkpoint.open()?,
//!         config.loader.open()?,
//!     )
//!     .with_retry(config.retry_policy())
//!     .with_chunking(config.chunking.clone());
//!
//!     let report = engine.run(&config.job).await?;
//!     println!("{} records, {}", report.records_extracted, report.outcome);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ExtractionEngine                           │
//! │   resume cursor → fetch chunk → load → checkpoint → next size   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//! ┌────────────┬─────────────┬───┴─────────┬────────────┬───────────┐
//! │ PageSource │ RetryPolicy │ ChunkCtrl   │ Loader     │ Checkpoint│
//! ├────────────┼─────────────┼─────────────┼────────────┼───────────┤
//! │ reqwest    │ 429 / 5xx   │ grow/shrink │ DuckDB     │ DuckDB    │
//! │ governor   │ backoff     │ bounds      │ Parquet    │ JSON file │
//! │ decoder    │ jitter      │             │ memory     │ memory    │
//! └────────────┴─────────────┴─────────────┴────────────┴───────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types
pub mod error;

/// Cursor, date window and shared enums
pub mod types;

/// Durable per-job progress
pub mod checkpoint;

/// Sales API client and rate limiting
pub mod http;

/// Page and record decoding
pub mod decode;

/// Retry and backoff policy
pub mod retry;

/// Adaptive chunk sizing
pub mod chunk;

/// Run metrics sinks
pub mod metrics;

/// Record loaders
pub mod loader;

/// Extraction loop
pub mod engine;

/// Pipeline configuration
pub mod config;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};
pub use types::*;

// Re-export commonly used types
pub use checkpoint::{CheckpointStore, SyncCheckpoint, SyncStatus};
pub use config::PipelineConfig;
pub use engine::{ExtractionEngine, RunOutcome, RunReport, SyncOptions};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
