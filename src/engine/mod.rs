//! Extraction engine module
//!
//! Chunked, resumable read loop over the sales API.
//!
//! # Overview
//!
//! The engine module provides:
//! - `ExtractionEngine` - Drives a job from its checkpoint to completion
//! - `SyncOptions` - What to sync and how far
//! - `RunReport` - What a run did and how it ended
//!
//! A run resolves its starting cursor from the checkpoint store, then
//! repeats fetch → load → checkpoint one chunk at a time. A chunk's cursor
//! is written only after the loader has accepted the chunk, so a crash or
//! cancellation at any point resumes from the last loaded chunk.

mod types;

pub use types::{
    ChunkSummary, FailureReason, RunOutcome, RunReport, SyncOptions, SyncStats,
};

use crate::checkpoint::{CheckpointStore, CheckpointUpdate, ChunkMetrics, SyncStatus};
use crate::chunk::{ChunkConfig, ChunkController};
use crate::decode::ExtractedRecord;
use crate::error::{Error, Result};
use crate::http::{FetchError, PageResult, PageSource};
use crate::loader::Loader;
use crate::metrics::{ChunkEvent, MetricsSink, NoopSink, RetryEvent};
use crate::retry::{FailureKind, RetryAction, RetryPolicy};
use crate::types::Cursor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default records requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Why the loop stopped before finishing the window
enum Halt {
    Failed {
        reason: FailureReason,
        message: String,
    },
    Cancelled,
}

impl Halt {
    fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Halt::Failed {
            reason,
            message: message.into(),
        }
    }
}

/// Records and bookkeeping for the chunk being fetched
#[derive(Default)]
struct PendingChunk {
    records: Vec<ExtractedRecord>,
    cursor: Option<Cursor>,
    pages: u32,
    api_calls: u64,
    retries: u32,
    errors: u32,
    end: Option<RunOutcome>,
}

/// Mutable state of one run
struct RunState<'a> {
    options: &'a SyncOptions,
    cursor: Option<Cursor>,
    records_extracted: u64,
    chunk_number: u64,
    newest_seen: Option<DateTime<Utc>>,
    early_exit_at: Option<DateTime<Utc>>,
    early_exit_disabled: bool,
    chunks: Vec<ChunkSummary>,
    stats: SyncStats,
}

impl RunState<'_> {
    /// Track ordering and report whether the page crossed the early-exit line
    fn observe_page(&mut self, records: &[ExtractedRecord]) -> bool {
        for record in records {
            match self.newest_seen {
                Some(newest) if record.timestamp < newest => {
                    if self.early_exit_at.is_some() && !self.early_exit_disabled {
                        warn!(
                            job = %self.options.job_name,
                            timestamp = %record.timestamp,
                            newest = %newest,
                            "Out-of-order record; early exit disabled for this run"
                        );
                        self.early_exit_disabled = true;
                    }
                }
                Some(newest) if record.timestamp <= newest => {}
                _ => self.newest_seen = Some(record.timestamp),
            }
        }

        if self.early_exit_disabled {
            return false;
        }
        match (self.early_exit_at, records.iter().map(|r| r.timestamp).max()) {
            (Some(threshold), Some(page_newest)) => page_newest >= threshold,
            _ => false,
        }
    }
}

/// Chunked, checkpointed extraction loop
pub struct ExtractionEngine {
    source: Arc<dyn PageSource>,
    store: Arc<dyn CheckpointStore>,
    loader: Arc<dyn Loader>,
    retry: RetryPolicy,
    chunking: ChunkConfig,
    metrics: Arc<dyn MetricsSink>,
    page_size: u32,
    cancel: CancellationToken,
}

impl ExtractionEngine {
    /// Create an engine with default retry, chunking and metrics
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn CheckpointStore>,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Self {
            source,
            store,
            loader,
            retry: RetryPolicy::default(),
            chunking: ChunkConfig::default(),
            metrics: Arc::new(NoopSink),
            page_size: DEFAULT_PAGE_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set chunk sizing
    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Set the metrics sink
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set records requested per page
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Use an external cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels runs of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Get the checkpoint store
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Run a job until exhaustion, early exit, failure or cancellation.
    ///
    /// Failures of the API, the loader or a checkpoint write end the run
    /// with a `Failed` report and an ERROR checkpoint. `Err` is reserved for
    /// invalid options, a store that cannot be read at start, and a failure
    /// whose ERROR checkpoint could not be written either.
    pub async fn run(&self, options: &SyncOptions) -> Result<RunReport> {
        options.validate()?;
        let started = Instant::now();
        let job = options.job_name.as_str();
        let range = options.date_range();

        // INIT
        if options.starts_fresh() {
            info!(job, window = %range, "Starting fresh; stored progress discarded");
            self.store.reset_job(job, &range).await?;
        } else {
            self.store.ensure_job(job, &range).await?;
        }
        let checkpoint = self
            .store
            .get_state(job)
            .await?
            .ok_or_else(|| Error::JobNotFound {
                job: job.to_string(),
            })?;

        let mut run = RunState {
            options,
            cursor: checkpoint.cursor.clone(),
            records_extracted: checkpoint.records_extracted,
            chunk_number: checkpoint.last_chunk_number.unwrap_or(0),
            newest_seen: None,
            early_exit_at: options
                .enable_early_exit
                .then(|| range.early_exit_threshold(options.buffer_days)),
            early_exit_disabled: false,
            chunks: Vec::new(),
            stats: SyncStats::default(),
        };
        let start_cursor = run.cursor.clone();
        let resumed = start_cursor.is_some();

        info!(
            job,
            window = %range,
            backend = self.store.backend_name(),
            loader = self.loader.name(),
            previous_status = %checkpoint.status,
            cursor = start_cursor.as_ref().map_or("<start>", Cursor::as_str),
            records = run.records_extracted,
            "Starting extraction"
        );

        let running =
            CheckpointUpdate::new(run.cursor.clone(), run.records_extracted, SyncStatus::Running);
        let outcome = match self.store.update_checkpoint(job, &running).await {
            Ok(()) => self.drive(&mut run).await,
            Err(e) => Err(Halt::failed(
                FailureReason::CheckpointFailed,
                format!("Could not mark the job running: {e}"),
            )),
        };

        let (outcome, failure, error_message) = match outcome {
            Ok(end) => {
                info!(
                    job,
                    outcome = %end,
                    records = run.records_extracted,
                    api_calls = run.stats.api_calls,
                    "Extraction completed"
                );
                (end, None, None)
            }
            Err(Halt::Failed { reason, message }) => {
                error!(job, reason = %reason, error = %message, "Extraction failed");
                let update = CheckpointUpdate::new(
                    run.cursor.clone(),
                    run.records_extracted,
                    SyncStatus::Error,
                )
                .with_error(message.clone());
                if let Err(e) = self.store.update_checkpoint(job, &update).await {
                    error!(job, error = %e, "Could not record the failure");
                    return Err(Error::checkpoint(format!(
                        "{message}; recording ERROR status also failed: {e}"
                    )));
                }
                (RunOutcome::Failed, Some(reason), Some(message))
            }
            Err(Halt::Cancelled) => {
                warn!(
                    job,
                    cursor = run.cursor.as_ref().map_or("<start>", Cursor::as_str),
                    "Extraction cancelled; partial chunk discarded"
                );
                (RunOutcome::Cancelled, None, None)
            }
        };

        run.stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(RunReport {
            job_name: job.to_string(),
            outcome,
            failure,
            error_message,
            resumed,
            start_cursor,
            final_cursor: run.cursor,
            records_extracted: run.records_extracted,
            early_exit_disabled: run.early_exit_disabled,
            chunks: run.chunks,
            stats: run.stats,
        })
    }

    /// Fetch, load and checkpoint chunks until the run ends
    async fn drive(&self, run: &mut RunState<'_>) -> std::result::Result<RunOutcome, Halt> {
        let options = run.options;
        let job = options.job_name.as_str();
        let mut controller = ChunkController::new(self.chunking.clone());
        let mut previous: Option<(Duration, u64, u32)> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            let planned = match previous {
                None => controller.current(),
                Some((duration, rows, errors)) => controller.next_chunk_size(duration, rows, errors),
            };

            // FETCHING
            let chunk_started = Instant::now();
            let pending = self.fetch_chunk(run, planned).await?;

            // CHECKPOINTING
            if pending.records.is_empty() {
                // nothing to load, but the cursor may still have moved
                let status = if pending.end.is_some() {
                    SyncStatus::Completed
                } else {
                    SyncStatus::Running
                };
                let update =
                    CheckpointUpdate::new(pending.cursor.clone(), run.records_extracted, status);
                self.checkpoint(job, &update).await?;
                run.cursor = pending.cursor;

                if let Some(end) = pending.end {
                    return Ok(end);
                }
                previous = Some((chunk_started.elapsed(), 0, pending.errors));
                continue;
            }

            let chunk_number = run.chunk_number + 1;
            let report = self.loader.load(&pending.records).await.map_err(|e| {
                Halt::failed(
                    FailureReason::LoaderFailed,
                    format!("Loader rejected chunk {chunk_number}: {e}"),
                )
            })?;

            let row_count = pending.records.len() as u64;
            let duration = chunk_started.elapsed();
            let records_extracted = run.records_extracted + row_count;
            let status = if pending.end.is_some() {
                SyncStatus::Completed
            } else {
                SyncStatus::Running
            };

            let update = CheckpointUpdate::new(pending.cursor.clone(), records_extracted, status)
                .with_chunk(ChunkMetrics {
                    chunk_number,
                    row_count,
                    duration_seconds: duration.as_secs_f64(),
                    completed_at: Utc::now(),
                });
            self.checkpoint(job, &update).await?;

            // the checkpoint is durable; the run may now move past it
            run.cursor = pending.cursor.clone();
            run.records_extracted = records_extracted;
            run.chunk_number = chunk_number;
            run.stats.chunks_completed += 1;
            run.stats.records_loaded += row_count;

            let summary = ChunkSummary {
                chunk_number,
                planned_pages: planned,
                pages: pending.pages,
                api_calls_made: pending.api_calls,
                row_count,
                duration_seconds: duration.as_secs_f64(),
                retries: pending.retries,
                errors: pending.errors,
                cursor: pending.cursor.clone(),
            };
            self.emit_chunk(job, &summary, report.written);
            run.chunks.push(summary);

            if let Some(end) = pending.end {
                return Ok(end);
            }
            previous = Some((duration, row_count, pending.errors));
        }
    }

    /// Write a chunk checkpoint, turning a store failure into a halt
    async fn checkpoint(
        &self,
        job: &str,
        update: &CheckpointUpdate,
    ) -> std::result::Result<(), Halt> {
        self.store.update_checkpoint(job, update).await.map_err(|e| {
            Halt::failed(
                FailureReason::CheckpointFailed,
                format!("Checkpoint write failed: {e}"),
            )
        })
    }

    /// Pull up to `planned` pages into a pending chunk
    async fn fetch_chunk(
        &self,
        run: &mut RunState<'_>,
        planned: u32,
    ) -> std::result::Result<PendingChunk, Halt> {
        let mut pending = PendingChunk {
            cursor: run.cursor.clone(),
            ..PendingChunk::default()
        };
        debug!(job = %run.options.job_name, planned, "Fetching chunk");

        while pending.pages < planned {
            if self.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            let page = self.fetch_page(run, &mut pending).await?;
            pending.pages += 1;
            run.stats.pages_fetched += 1;

            if page.empty {
                pending.end = Some(RunOutcome::Exhausted);
                break;
            }

            if let (Some(current), Some(next)) = (&pending.cursor, &page.next_cursor) {
                if next.is_before(current) {
                    let err = Error::CursorRegressed {
                        previous: current.to_string(),
                        next: next.to_string(),
                    };
                    return Err(Halt::failed(FailureReason::CursorRegressed, err.to_string()));
                }
            }

            run.stats.records_fetched += page.records.len() as u64;
            let crossed = run.observe_page(&page.records);
            pending.records.extend(page.records);

            match page.next_cursor {
                Some(next) => pending.cursor = Some(next),
                None => {
                    pending.end = Some(RunOutcome::Exhausted);
                    break;
                }
            }

            if crossed {
                info!(
                    job = %run.options.job_name,
                    newest = ?run.newest_seen,
                    "Records passed the end of the window; stopping early"
                );
                pending.end = Some(RunOutcome::EarlyExit);
                break;
            }
        }

        Ok(pending)
    }

    /// One page, retried according to the policy
    async fn fetch_page(
        &self,
        run: &mut RunState<'_>,
        pending: &mut PendingChunk,
    ) -> std::result::Result<PageResult, Halt> {
        let options = run.options;
        let job = options.job_name.as_str();
        let mut transient_attempts = 0u32;
        let mut rate_limited_attempts = 0u32;

        loop {
            if run.stats.api_calls >= options.max_api_calls {
                return Err(Halt::failed(
                    FailureReason::ApiCallLimit,
                    format!(
                        "API call limit of {} reached; cursor left at last checkpoint",
                        options.max_api_calls
                    ),
                ));
            }
            run.stats.api_calls += 1;
            pending.api_calls += 1;

            let err: FetchError = match self
                .source
                .fetch_page(pending.cursor.as_ref(), self.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            let attempt = match err.kind {
                FailureKind::RateLimited { .. } => {
                    run.stats.rate_limited += 1;
                    rate_limited_attempts += 1;
                    rate_limited_attempts
                }
                FailureKind::Transient => {
                    run.stats.transient_errors += 1;
                    pending.errors += 1;
                    transient_attempts += 1;
                    transient_attempts
                }
                FailureKind::Fatal => 1,
            };

            let wait = match self.retry.next_action(err.kind, attempt) {
                RetryAction::Retry(wait) => wait,
                RetryAction::GiveUp => {
                    let reason = if err.kind.is_transient() {
                        FailureReason::RetriesExhausted
                    } else {
                        FailureReason::FatalResponse
                    };
                    let message = if err.kind.is_transient() {
                        format!("Gave up after {attempt} transient failures: {}", err.source)
                    } else {
                        err.source.to_string()
                    };
                    return Err(Halt::failed(reason, message));
                }
            };

            run.stats.retries += 1;
            pending.retries += 1;
            let event = RetryEvent {
                job_name: job.to_string(),
                attempt,
                wait_seconds: wait.as_secs_f64(),
                reason: err.kind.label().to_string(),
                detail: err.source.to_string(),
            };
            warn!(
                job,
                attempt,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                reason = %event.reason,
                error = %event.detail,
                "Retrying page fetch"
            );
            self.metrics.retry_scheduled(&event);

            tokio::select! {
                () = self.cancel.cancelled() => return Err(Halt::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn emit_chunk(&self, job: &str, summary: &ChunkSummary, written: usize) {
        info!(
            job,
            chunk = summary.chunk_number,
            pages = summary.pages,
            rows = summary.row_count,
            written,
            api_calls = summary.api_calls_made,
            retries = summary.retries,
            duration_ms = (summary.duration_seconds * 1000.0) as u64,
            cursor = summary.cursor.as_ref().map_or("", Cursor::as_str),
            "Chunk checkpointed"
        );
        self.metrics.chunk_completed(&ChunkEvent {
            job_name: job.to_string(),
            chunk_number: summary.chunk_number,
            duration_seconds: summary.duration_seconds,
            row_count: summary.row_count,
            api_calls: summary.api_calls_made,
            cursor: summary.cursor.clone(),
            retries: summary.retries,
        });
    }
}

impl std::fmt::Debug for ExtractionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionEngine")
            .field("store", &self.store.backend_name())
            .field("loader", &self.loader.name())
            .field("retry", &self.retry)
            .field("chunking", &self.chunking)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
