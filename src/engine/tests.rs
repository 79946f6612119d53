//! Tests for engine module

use super::*;
use crate::checkpoint::{InMemoryCheckpointStore, SyncCheckpoint};
use crate::loader::{LoadReport, MemoryLoader};
use crate::metrics::MemorySink;
use crate::retry::RetryConfig;
use crate::types::DateRange;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// ============================================================================
// Fixtures
// ============================================================================

/// Records `first_id..first_id + count`, all on October 1st plus `day_offset` days
fn records(first_id: u64, count: u64, day_offset: i64) -> Vec<ExtractedRecord> {
    let base = Utc.with_ymd_and_hms(2018, 10, 1, 0, 0, 0).unwrap();
    (first_id..first_id + count)
        .map(|id| {
            let ts = base
                + chrono::Duration::days(day_offset)
                + chrono::Duration::seconds(i64::try_from(id).unwrap());
            ExtractedRecord::new(Some(id.to_string()), ts, json!({"id": id, "amount": 10}))
        })
        .collect()
}

/// `n` pages of `per_page` records, all inside October
fn pages(n: u64, per_page: u64) -> Vec<Vec<ExtractedRecord>> {
    (0..n).map(|i| records(i * per_page, per_page, 0)).collect()
}

fn cursor(page: usize) -> Cursor {
    Cursor::new(format!("0x{page:x}"))
}

fn october() -> SyncOptions {
    SyncOptions::new(
        "sales_sync",
        NaiveDate::from_ymd_opt(2018, 10, 1).unwrap(),
        NaiveDate::from_ymd_opt(2018, 10, 31).unwrap(),
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        initial_backoff_ms: 100,
        jitter: false,
        ..RetryConfig::default()
    })
}

fn failure(kind: FailureKind) -> FetchError {
    match kind {
        FailureKind::RateLimited { retry_after } => FetchError::rate_limited(retry_after),
        FailureKind::Transient => FetchError::transient("connection reset by peer"),
        FailureKind::Fatal => FetchError::fatal("400 Bad Request: unknown parameter"),
    }
}

fn rate_limited(secs: u64) -> Option<FailureKind> {
    Some(FailureKind::RateLimited {
        retry_after: Some(Duration::from_secs(secs)),
    })
}

/// Serves a fixed stream of pages addressed by hex page index.
///
/// Requesting no cursor yields page 0; page `i` points at `0x{i+1}`.
/// Requests past the last page get an empty page. Scripted faults are
/// consumed one per call before any page is served.
struct StreamSource {
    pages: Vec<Vec<ExtractedRecord>>,
    faults: Mutex<VecDeque<Option<FailureKind>>>,
    requested: Mutex<Vec<Option<Cursor>>>,
    calls: AtomicUsize,
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl StreamSource {
    fn new(pages: Vec<Vec<ExtractedRecord>>) -> Self {
        Self {
            pages,
            faults: Mutex::new(VecDeque::new()),
            requested: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            cancel_on_call: None,
        }
    }

    fn with_faults(self, faults: Vec<Option<FailureKind>>) -> Self {
        *self.faults.lock().unwrap() = faults.into();
        self
    }

    fn cancel_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requested(&self) -> Vec<Option<Cursor>> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for StreamSource {
    async fn fetch_page(&self, from: Option<&Cursor>, _page_size: u32) -> crate::http::FetchResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested.lock().unwrap().push(from.cloned());
        if let Some((at, token)) = &self.cancel_on_call {
            if call == *at {
                token.cancel();
            }
        }

        if let Some(Some(kind)) = self.faults.lock().unwrap().pop_front() {
            return Err(failure(kind));
        }

        let index = from.map_or(0, |c| c.position().unwrap() as usize);
        match self.pages.get(index) {
            Some(page) => Ok(PageResult::new(page.clone(), Some(cursor(index + 1)))),
            None => Ok(PageResult::exhausted()),
        }
    }
}

/// Answers the first request with cursor `0x20`, every later one with `0x10`
struct RegressingSource;

#[async_trait]
impl PageSource for RegressingSource {
    async fn fetch_page(&self, from: Option<&Cursor>, _page_size: u32) -> crate::http::FetchResult {
        match from {
            None => Ok(PageResult::new(records(0, 5, 0), Some(Cursor::new("0x20")))),
            Some(_) => Ok(PageResult::new(records(5, 5, 0), Some(Cursor::new("0x10")))),
        }
    }
}

/// Memory loader that rejects its `fail_on`-th call
struct FailingLoader {
    inner: MemoryLoader,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Loader for FailingLoader {
    async fn load(&self, records: &[ExtractedRecord]) -> Result<LoadReport> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(Error::loader("disk full"));
        }
        self.inner.load(records).await
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Checkpoint store that remembers every cursor written through it
#[derive(Default)]
struct RecordingStore {
    inner: InMemoryCheckpointStore,
    writes: Mutex<Vec<(Option<Cursor>, SyncStatus)>>,
    reject: Option<fn(&CheckpointUpdate) -> bool>,
}

impl RecordingStore {
    fn rejecting(reject: fn(&CheckpointUpdate) -> bool) -> Self {
        Self {
            reject: Some(reject),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn get_state(&self, job_name: &str) -> Result<Option<SyncCheckpoint>> {
        self.inner.get_state(job_name).await
    }

    async fn ensure_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        self.inner.ensure_job(job_name, range).await
    }

    async fn update_checkpoint(&self, job_name: &str, update: &CheckpointUpdate) -> Result<()> {
        if self.reject.is_some_and(|reject| reject(update)) {
            return Err(Error::checkpoint("database is locked"));
        }
        self.writes
            .lock()
            .unwrap()
            .push((update.cursor.clone(), update.status));
        self.inner.update_checkpoint(job_name, update).await
    }

    async fn reset_job(&self, job_name: &str, range: &DateRange) -> Result<()> {
        self.inner.reset_job(job_name, range).await
    }

    async fn list_jobs(&self) -> Result<Vec<SyncCheckpoint>> {
        self.inner.list_jobs().await
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}

struct Harness {
    source: Arc<StreamSource>,
    store: Arc<InMemoryCheckpointStore>,
    loader: Arc<MemoryLoader>,
    sink: MemorySink,
}

impl Harness {
    fn new(source: StreamSource) -> Self {
        Self {
            source: Arc::new(source),
            store: Arc::new(InMemoryCheckpointStore::new()),
            loader: Arc::new(MemoryLoader::new()),
            sink: MemorySink::new(),
        }
    }

    fn engine(&self, chunking: ChunkConfig) -> ExtractionEngine {
        ExtractionEngine::new(self.source.clone(), self.store.clone(), self.loader.clone())
            .with_retry(fast_retry())
            .with_chunking(chunking)
            .with_metrics(Arc::new(self.sink.clone()))
    }

    async fn state(&self) -> SyncCheckpoint {
        self.store.get_state("sales_sync").await.unwrap().unwrap()
    }

    async fn seed(&self, cursor: &str, records: u64, status: SyncStatus, last_chunk: u64) {
        let mut row = SyncCheckpoint::new(1, "sales_sync", Some(&october().date_range()), Utc::now());
        row.cursor = Some(Cursor::new(cursor));
        row.records_extracted = records;
        row.status = status;
        row.last_chunk_number = Some(last_chunk);
        self.store.insert(row).await;
    }
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_clean_full_sync() {
    let h = Harness::new(StreamSource::new(vec![
        records(0, 1000, 0),
        records(1000, 1000, 0),
        records(2000, 400, 0),
    ]));

    let report = h.engine(ChunkConfig::fixed(2)).run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.failure, None);
    assert_eq!(report.records_extracted, 2400);
    assert_eq!(report.final_cursor, Some(cursor(3)));
    assert_eq!(report.chunks.len(), 2);
    assert_eq!(report.chunks[0].row_count, 2000);
    assert_eq!(report.chunks[1].row_count, 400);
    assert_eq!(report.stats.api_calls, 4);
    assert!(!report.resumed);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Completed);
    assert_eq!(state.records_extracted, 2400);
    assert_eq!(state.cursor, Some(cursor(3)));
    assert_eq!(state.last_chunk_number, Some(2));
    assert_eq!(state.last_chunk_row_count, Some(400));
    assert!(state.completed_at.is_some());
    assert!(state.error_message.is_none());

    assert_eq!(h.loader.len(), 2400);
    let chunks = h.sink.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_number, 1);
    assert_eq!(chunks[0].api_calls, 2);
    assert_eq!(chunks[1].chunk_number, 2);
}

#[tokio::test]
async fn test_empty_stream_completes_without_chunks() {
    let h = Harness::new(StreamSource::new(Vec::new()));

    let report = h.engine(ChunkConfig::fixed(2)).run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert!(report.chunks.is_empty());
    assert_eq!(report.records_extracted, 0);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Completed);
    assert_eq!(state.cursor, None);
    assert_eq!(state.last_chunk_number, None);
    assert!(h.sink.chunks().is_empty());
    assert_eq!(h.loader.load_calls(), 0);
}

#[tokio::test]
async fn test_checkpointed_cursor_never_moves_backwards() {
    let source = Arc::new(StreamSource::new(pages(7, 10)));
    let store = Arc::new(RecordingStore::default());
    let engine = ExtractionEngine::new(source, store.clone(), Arc::new(MemoryLoader::new()))
        .with_chunking(ChunkConfig::fixed(2));

    engine.run(&october()).await.unwrap();

    let writes = store.writes.lock().unwrap().clone();
    assert!(writes.len() >= 5);
    for pair in writes.windows(2) {
        match (&pair[0].0, &pair[1].0) {
            (Some(a), Some(b)) => assert!(!b.is_before(a), "{b} written after {a}"),
            (Some(a), None) => panic!("cursor cleared after {a}"),
            _ => {}
        }
    }
    assert_eq!(writes.last().unwrap().1, SyncStatus::Completed);
}

#[tokio::test]
async fn test_chunk_size_grows_while_chunks_are_fast() {
    let h = Harness::new(StreamSource::new(pages(8, 10)));

    let report = h
        .engine(ChunkConfig::default().with_bounds(1, 4))
        .run(&october())
        .await
        .unwrap();

    let planned: Vec<u32> = report.chunks.iter().map(|c| c.planned_pages).collect();
    assert_eq!(planned, vec![1, 2, 4, 4]);
    assert_eq!(report.records_extracted, 80);
    assert_eq!(report.outcome, RunOutcome::Exhausted);
}

#[tokio::test]
async fn test_invalid_options_touch_nothing() {
    let h = Harness::new(StreamSource::new(pages(1, 10)));
    let mut options = october();
    options.end_date = NaiveDate::from_ymd_opt(2018, 9, 1).unwrap();

    assert!(h.engine(ChunkConfig::fixed(1)).run(&options).await.is_err());
    assert!(h.store.get_state("sales_sync").await.unwrap().is_none());
    assert_eq!(h.source.calls(), 0);
}

// ============================================================================
// Resume and restart
// ============================================================================

#[tokio::test]
async fn test_resume_continues_from_stored_cursor() {
    let h = Harness::new(StreamSource::new(pages(4, 10)));
    h.seed("0x2", 20, SyncStatus::Error, 1).await;

    let report = h.engine(ChunkConfig::fixed(2)).run(&october()).await.unwrap();

    assert!(report.resumed);
    assert_eq!(report.start_cursor, Some(cursor(2)));
    assert_eq!(h.source.requested()[0], Some(cursor(2)));
    assert_eq!(report.chunks[0].chunk_number, 2);
    assert_eq!(report.records_extracted, 40);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Completed);
    assert_eq!(state.records_extracted, 40);
    assert_eq!(state.last_chunk_number, Some(2));
    assert_eq!(h.loader.len(), 20);
}

#[tokio::test]
async fn test_force_restart_ignores_stored_cursor() {
    let h = Harness::new(StreamSource::new(pages(1, 10)));
    h.seed("0xABC", 77, SyncStatus::Error, 9).await;

    let report = h
        .engine(ChunkConfig::fixed(2))
        .run(&october().with_force_restart(true))
        .await
        .unwrap();

    assert!(!report.resumed);
    assert_eq!(report.start_cursor, None);
    assert_eq!(h.source.requested()[0], None);
    assert_eq!(report.records_extracted, 10);

    let state = h.state().await;
    assert_eq!(state.records_extracted, 10);
    assert_eq!(state.last_chunk_number, Some(1));
    assert_eq!(state.status, SyncStatus::Completed);
}

#[tokio::test]
async fn test_resume_disabled_starts_over() {
    let h = Harness::new(StreamSource::new(pages(2, 10)));
    h.seed("0x1", 10, SyncStatus::Running, 1).await;

    let report = h
        .engine(ChunkConfig::fixed(5))
        .run(&october().with_resume(false))
        .await
        .unwrap();

    assert_eq!(h.source.requested()[0], None);
    assert_eq!(report.records_extracted, 20);
    assert_eq!(h.state().await.last_chunk_number, Some(1));
}

#[tokio::test]
async fn test_cancel_then_resume_matches_uninterrupted_run() {
    let uninterrupted = Harness::new(StreamSource::new(pages(6, 10)));
    uninterrupted
        .engine(ChunkConfig::fixed(2))
        .run(&october())
        .await
        .unwrap();

    let token = CancellationToken::new();
    let first = Harness::new(StreamSource::new(pages(6, 10)).cancel_on_call(3, token.clone()));
    let report = first
        .engine(ChunkConfig::fixed(2))
        .with_cancellation(token)
        .run(&october())
        .await
        .unwrap();

    // chunk 2 was mid-flight: its page is fetched but never checkpointed
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.final_cursor, Some(cursor(2)));
    assert_eq!(first.source.calls(), 3);
    let state = first.state().await;
    assert_eq!(state.status, SyncStatus::Running);
    assert_eq!(state.cursor, Some(cursor(2)));
    assert_eq!(state.last_chunk_number, Some(1));
    assert_eq!(first.loader.load_calls(), 1);

    let resumed = ExtractionEngine::new(
        Arc::new(StreamSource::new(pages(6, 10))),
        first.store.clone(),
        first.loader.clone(),
    )
    .with_chunking(ChunkConfig::fixed(2));
    let report = resumed.run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.records_extracted, 60);
    assert_eq!(first.loader.records(), uninterrupted.loader.records());
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_storm_waits_for_retry_after() {
    let h = Harness::new(
        StreamSource::new(pages(1, 10)).with_faults(vec![
            rate_limited(5),
            rate_limited(5),
            rate_limited(5),
        ]),
    );

    let started = Instant::now();
    let report = h.engine(ChunkConfig::fixed(1)).run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert!(started.elapsed() >= Duration::from_secs(15));

    let retries = h.sink.retries();
    assert_eq!(retries.len(), 3);
    for (i, event) in retries.iter().enumerate() {
        assert_eq!(event.reason, "rate_limited");
        assert_eq!(event.wait_seconds, 5.0);
        assert_eq!(event.attempt, u32::try_from(i).unwrap() + 1);
    }

    assert_eq!(report.stats.rate_limited, 3);
    assert_eq!(report.stats.api_calls, 5);
    assert_eq!(report.chunks[0].retries, 3);
    assert_eq!(report.chunks[0].errors, 0);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Completed);
    assert!(state.error_message.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover() {
    let h = Harness::new(
        StreamSource::new(pages(2, 10)).with_faults(vec![
            Some(FailureKind::Transient),
            Some(FailureKind::Transient),
        ]),
    );

    let report = h.engine(ChunkConfig::fixed(2)).run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.records_extracted, 20);
    assert_eq!(report.chunks[0].errors, 2);

    let waits: Vec<f64> = h.sink.retries().iter().map(|e| e.wait_seconds).collect();
    assert_eq!(waits, vec![0.1, 0.2]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_cap_fails_the_run() {
    let mut faults = vec![None];
    faults.extend(std::iter::repeat(Some(FailureKind::Transient)).take(6));
    let h = Harness::new(StreamSource::new(pages(3, 10)).with_faults(faults));

    let report = h.engine(ChunkConfig::fixed(1)).run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.failure, Some(FailureReason::RetriesExhausted));
    assert_eq!(report.stats.api_calls, 7);
    assert_eq!(h.sink.retries().len(), 5);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.cursor, Some(cursor(1)));
    assert_eq!(state.records_extracted, 10);
    assert_eq!(state.last_chunk_number, Some(1));
    assert!(state.error_message.unwrap().contains("6 transient"));
}

#[tokio::test]
async fn test_fatal_response_fails_without_retry() {
    let h = Harness::new(StreamSource::new(pages(1, 10)).with_faults(vec![Some(FailureKind::Fatal)]));

    let report = h.engine(ChunkConfig::fixed(1)).run(&october()).await.unwrap();

    assert_eq!(report.failure, Some(FailureReason::FatalResponse));
    assert_eq!(report.stats.api_calls, 1);
    assert!(h.sink.retries().is_empty());

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.cursor, None);
    assert!(state.error_message.unwrap().contains("400"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let token = CancellationToken::new();
    let h = Harness::new(
        StreamSource::new(pages(1, 10))
            .with_faults(vec![Some(FailureKind::Transient)])
            .cancel_on_call(1, token.clone()),
    );

    let report = h
        .engine(ChunkConfig::fixed(1))
        .with_cancellation(token)
        .run(&october())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(h.source.calls(), 1);
    assert_eq!(h.sink.retries().len(), 1);
    assert_eq!(h.state().await.status, SyncStatus::Running);
}

// ============================================================================
// Stop conditions
// ============================================================================

#[tokio::test]
async fn test_api_call_limit_discards_partial_chunk() {
    let h = Harness::new(StreamSource::new(pages(10, 10)));

    let report = h
        .engine(ChunkConfig::fixed(2))
        .run(&october().with_max_api_calls(5))
        .await
        .unwrap();

    assert_eq!(report.failure, Some(FailureReason::ApiCallLimit));
    assert_eq!(report.stats.api_calls, 5);
    assert_eq!(h.source.calls(), 5);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.cursor, Some(cursor(4)));
    assert_eq!(state.records_extracted, 40);
    assert_eq!(state.last_chunk_number, Some(2));
    assert_eq!(h.loader.len(), 40);
}

#[tokio::test]
async fn test_early_exit_stops_fetching() {
    let h = Harness::new(StreamSource::new(vec![
        records(0, 10, 0),
        // November 1st is inside the one-day buffer
        records(100, 10, 31),
        records(200, 10, 32),
        records(300, 10, 40),
    ]));

    let report = h.engine(ChunkConfig::fixed(10)).run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::EarlyExit);
    assert_eq!(h.source.calls(), 3);
    assert_eq!(report.records_extracted, 30);
    assert!(!report.early_exit_disabled);

    let state = h.state().await;
    assert_eq!(state.status, SyncStatus::Completed);
    assert_eq!(state.cursor, Some(cursor(3)));
}

#[tokio::test]
async fn test_early_exit_can_be_switched_off() {
    let h = Harness::new(StreamSource::new(vec![
        records(0, 10, 0),
        records(200, 10, 32),
        records(300, 10, 40),
    ]));

    let report = h
        .engine(ChunkConfig::fixed(10))
        .run(&october().with_early_exit(false, 1))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(h.source.calls(), 4);
    assert_eq!(report.records_extracted, 30);
}

#[tokio::test]
async fn test_out_of_order_records_disable_early_exit() {
    let h = Harness::new(StreamSource::new(vec![
        records(0, 10, 10),
        records(100, 10, 5),
        records(200, 10, 40),
        records(300, 10, 41),
    ]));

    let report = h.engine(ChunkConfig::fixed(10)).run(&october()).await.unwrap();

    assert!(report.early_exit_disabled);
    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(h.source.calls(), 5);
    assert_eq!(report.records_extracted, 40);
}

#[tokio::test]
async fn test_cursor_regression_fails_the_run() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = ExtractionEngine::new(
        Arc::new(RegressingSource),
        store.clone(),
        Arc::new(MemoryLoader::new()),
    )
    .with_chunking(ChunkConfig::fixed(1));

    let report = engine.run(&october()).await.unwrap();

    assert_eq!(report.failure, Some(FailureReason::CursorRegressed));
    let state = store.get_state("sales_sync").await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.cursor, Some(Cursor::new("0x20")));
    assert_eq!(state.records_extracted, 5);
    assert!(state.error_message.unwrap().contains("0x10"));
}

#[tokio::test]
async fn test_loader_failure_keeps_previous_checkpoint() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let loader = Arc::new(FailingLoader {
        inner: MemoryLoader::new(),
        fail_on: 2,
        calls: AtomicUsize::new(0),
    });
    let engine = ExtractionEngine::new(
        Arc::new(StreamSource::new(pages(3, 10))),
        store.clone(),
        loader.clone(),
    )
    .with_chunking(ChunkConfig::fixed(1));

    let report = engine.run(&october()).await.unwrap();

    assert_eq!(report.failure, Some(FailureReason::LoaderFailed));
    assert_eq!(report.chunks.len(), 1);

    let state = store.get_state("sales_sync").await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.cursor, Some(cursor(1)));
    assert_eq!(state.records_extracted, 10);
    assert_eq!(state.last_chunk_number, Some(1));
    assert!(state.error_message.unwrap().contains("disk full"));
    assert_eq!(loader.inner.len(), 10);
}

#[tokio::test]
async fn test_chunk_checkpoint_failure_records_error() {
    let store = Arc::new(RecordingStore::rejecting(|update| update.chunk.is_some()));
    let loader = Arc::new(MemoryLoader::new());
    let engine = ExtractionEngine::new(
        Arc::new(StreamSource::new(pages(3, 10))),
        store.clone(),
        loader.clone(),
    )
    .with_chunking(ChunkConfig::fixed(1));

    let report = engine.run(&october()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.failure, Some(FailureReason::CheckpointFailed));
    assert!(report.chunks.is_empty());
    assert_eq!(report.final_cursor, None);

    let state = store.get_state("sales_sync").await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.cursor, None);
    assert_eq!(state.records_extracted, 0);
    assert!(state.error_message.unwrap().contains("database is locked"));
    // the chunk reached the loader; a resume re-delivers it
    assert_eq!(loader.len(), 10);
}

#[tokio::test]
async fn test_unwritable_store_surfaces_both_errors() {
    let store = Arc::new(RecordingStore::rejecting(|update| {
        update.chunk.is_some() || update.status == SyncStatus::Error
    }));
    let engine = ExtractionEngine::new(
        Arc::new(StreamSource::new(pages(2, 10))),
        store.clone(),
        Arc::new(MemoryLoader::new()),
    )
    .with_chunking(ChunkConfig::fixed(1));

    let err = engine.run(&october()).await.unwrap_err();

    let text = err.to_string();
    assert!(text.contains("Checkpoint write failed"), "{text}");
    assert!(text.contains("recording ERROR status also failed"), "{text}");
    let state = store.get_state("sales_sync").await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Running);
}

#[tokio::test]
async fn test_running_mark_failure_stops_before_fetching() {
    let source = Arc::new(StreamSource::new(pages(2, 10)));
    let store = Arc::new(RecordingStore::rejecting(|update| {
        update.status == SyncStatus::Running
    }));
    let engine = ExtractionEngine::new(source.clone(), store.clone(), Arc::new(MemoryLoader::new()));

    let report = engine.run(&october()).await.unwrap();

    assert_eq!(report.failure, Some(FailureReason::CheckpointFailed));
    assert_eq!(source.calls(), 0);
    let state = store.get_state("sales_sync").await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Error);
}

/// Serves record-less pages that still hand out a new cursor, then data
struct SparseSource {
    calls: AtomicUsize,
}

#[async_trait]
impl PageSource for SparseSource {
    async fn fetch_page(&self, from: Option<&Cursor>, _page_size: u32) -> crate::http::FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = from.map_or(0, |c| c.position().unwrap() as usize);
        let page = match index {
            0 | 1 => PageResult {
                records: Vec::new(),
                next_cursor: Some(cursor(index + 1)),
                empty: false,
            },
            2 => PageResult::new(records(0, 10, 0), Some(cursor(3))),
            _ => PageResult::exhausted(),
        };
        Ok(page)
    }
}

#[tokio::test]
async fn test_record_less_pages_still_advance_the_cursor() {
    let source = Arc::new(SparseSource {
        calls: AtomicUsize::new(0),
    });
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = ExtractionEngine::new(source.clone(), store.clone(), Arc::new(MemoryLoader::new()))
        .with_chunking(ChunkConfig::fixed(1));

    let report = engine
        .run(&october().with_max_api_calls(10))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted);
    assert_eq!(report.records_extracted, 10);
    assert_eq!(report.final_cursor, Some(cursor(3)));
    assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    let state = store.get_state("sales_sync").await.unwrap().unwrap();
    assert_eq!(state.cursor, Some(cursor(3)));
    assert_eq!(state.status, SyncStatus::Completed);
}

#[test]
fn test_engine_debug_hides_components() {
    let engine = ExtractionEngine::new(
        Arc::new(StreamSource::new(Vec::new())),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(MemoryLoader::new()),
    )
    .with_page_size(0);
    let debug = format!("{engine:?}");
    assert!(debug.contains("memory"));
    assert!(debug.contains("page_size: 1"));
}
