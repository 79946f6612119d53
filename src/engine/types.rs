//! Engine types
//!
//! Run options going in, run reports coming out.

use crate::checkpoint::SyncStatus;
use crate::error::{Error, Result};
use crate::types::{Cursor, DateRange};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Options for one extraction run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Checkpoint identity
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// First day of the target window
    pub start_date: NaiveDate,

    /// Last day of the target window (inclusive)
    pub end_date: NaiveDate,

    /// Stop once records lie beyond `end_date + buffer_days`
    #[serde(default = "default_true")]
    pub enable_early_exit: bool,

    /// Grace period after `end_date` before early exit triggers
    #[serde(default = "default_buffer_days")]
    pub buffer_days: u32,

    /// Continue from the stored cursor
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Discard stored progress and start over
    #[serde(default)]
    pub force_restart: bool,

    /// Hard ceiling on HTTP calls per run, retries included
    #[serde(default = "default_max_api_calls")]
    pub max_api_calls: u64,
}

fn default_job_name() -> String {
    "sales_sync".to_string()
}

fn default_true() -> bool {
    true
}

fn default_buffer_days() -> u32 {
    1
}

fn default_max_api_calls() -> u64 {
    10_000
}

impl SyncOptions {
    /// Options for `job_name` over `[start_date, end_date]` with defaults elsewhere
    pub fn new(job_name: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            job_name: job_name.into(),
            start_date,
            end_date,
            enable_early_exit: default_true(),
            buffer_days: default_buffer_days(),
            resume: default_true(),
            force_restart: false,
            max_api_calls: default_max_api_calls(),
        }
    }

    /// Target window
    pub fn date_range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }

    /// Whether stored progress is discarded at start
    pub fn starts_fresh(&self) -> bool {
        self.force_restart || !self.resume
    }

    /// Set early exit
    #[must_use]
    pub fn with_early_exit(mut self, enabled: bool, buffer_days: u32) -> Self {
        self.enable_early_exit = enabled;
        self.buffer_days = buffer_days;
        self
    }

    /// Set resume
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Set force restart
    #[must_use]
    pub fn with_force_restart(mut self, force: bool) -> Self {
        self.force_restart = force;
        self
    }

    /// Set the API call ceiling
    #[must_use]
    pub fn with_max_api_calls(mut self, max: u64) -> Self {
        self.max_api_calls = max;
        self
    }

    /// Reject options no run could honour
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(Error::invalid_value("job.job_name", "must not be empty"));
        }
        if self.end_date < self.start_date {
            return Err(Error::invalid_value(
                "job.end_date",
                format!("{} is before start_date {}", self.end_date, self.start_date),
            ));
        }
        if self.max_api_calls == 0 {
            return Err(Error::invalid_value("job.max_api_calls", "must be at least 1"));
        }
        Ok(())
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The API returned an empty page or no further cursor
    Exhausted,
    /// Records passed the end of the window plus buffer
    EarlyExit,
    /// The run stopped on an error; see [`FailureReason`]
    Failed,
    /// Cancelled between chunks or during a backoff sleep
    Cancelled,
}

impl RunOutcome {
    /// Whether the job finished its window
    pub fn is_success(self) -> bool {
        matches!(self, RunOutcome::Exhausted | RunOutcome::EarlyExit)
    }

    /// Checkpoint status the outcome leaves behind
    pub fn final_status(self) -> SyncStatus {
        match self {
            RunOutcome::Exhausted | RunOutcome::EarlyExit => SyncStatus::Completed,
            RunOutcome::Failed => SyncStatus::Error,
            RunOutcome::Cancelled => SyncStatus::Running,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::EarlyExit => "early_exit",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        })
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Transient failures exceeded the retry cap
    RetriesExhausted,
    /// The API answered with something retrying cannot fix
    FatalResponse,
    /// The per-run HTTP call ceiling was hit
    ApiCallLimit,
    /// The API handed back a cursor behind the current one
    CursorRegressed,
    /// The loader rejected a chunk
    LoaderFailed,
    /// The checkpoint store rejected a write
    CheckpointFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::FatalResponse => "fatal_response",
            FailureReason::ApiCallLimit => "api_call_limit",
            FailureReason::CursorRegressed => "cursor_regressed",
            FailureReason::LoaderFailed => "loader_failed",
            FailureReason::CheckpointFailed => "checkpoint_failed",
        })
    }
}

/// One loaded and checkpointed chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkSummary {
    /// 1-based chunk number within the job
    pub chunk_number: u64,
    /// Pages requested for the chunk
    pub planned_pages: u32,
    /// Pages actually fetched
    pub pages: u32,
    /// HTTP calls, retries included
    pub api_calls_made: u64,
    /// Records in the chunk
    pub row_count: u64,
    /// Fetch plus load time
    pub duration_seconds: f64,
    /// Retry decisions taken
    pub retries: u32,
    /// Transient failures seen
    pub errors: u32,
    /// Cursor checkpointed after the chunk
    pub cursor: Option<Cursor>,
}

/// Counters for a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    /// HTTP calls made, retries included
    pub api_calls: u64,
    /// Successful page fetches
    pub pages_fetched: u64,
    /// Records fetched this run, including any discarded partial chunk
    pub records_fetched: u64,
    /// Records loaded and checkpointed this run
    pub records_loaded: u64,
    /// Chunks checkpointed this run
    pub chunks_completed: u64,
    /// Retry decisions taken
    pub retries: u64,
    /// 429 responses
    pub rate_limited: u64,
    /// Transient failures
    pub transient_errors: u64,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

/// Everything a run did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Job that ran
    pub job_name: String,
    /// How it ended
    pub outcome: RunOutcome,
    /// Set when `outcome` is `Failed`
    pub failure: Option<FailureReason>,
    /// Human-readable failure message
    pub error_message: Option<String>,
    /// Whether the run continued from a stored cursor
    pub resumed: bool,
    /// Cursor the run started from
    pub start_cursor: Option<Cursor>,
    /// Last checkpointed cursor
    pub final_cursor: Option<Cursor>,
    /// Cumulative records for the job, as checkpointed
    pub records_extracted: u64,
    /// Early exit was switched off after out-of-order records
    pub early_exit_disabled: bool,
    /// Chunks checkpointed this run
    pub chunks: Vec<ChunkSummary>,
    /// Run counters
    pub stats: SyncStats,
}

impl RunReport {
    /// Checkpoint status the run left behind
    pub fn final_status(&self) -> SyncStatus {
        self.outcome.final_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn october() -> SyncOptions {
        SyncOptions::new(
            "sales_sync",
            NaiveDate::from_ymd_opt(2018, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2018, 10, 31).unwrap(),
        )
    }

    #[test]
    fn test_sync_options_defaults() {
        let options = october();
        assert!(options.resume);
        assert!(!options.force_restart);
        assert!(options.enable_early_exit);
        assert_eq!(options.buffer_days, 1);
        assert_eq!(options.max_api_calls, 10_000);
        assert!(!options.starts_fresh());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_sync_options_from_yaml() {
        let yaml = r"
job_name: pos_backfill
start_date: 2018-10-01
end_date: 2018-12-31
buffer_days: 3
force_restart: true
";
        let options: SyncOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.job_name, "pos_backfill");
        assert_eq!(options.date_range().days(), 92);
        assert_eq!(options.buffer_days, 3);
        assert!(options.starts_fresh());
    }

    #[test]
    fn test_sync_options_validation() {
        let mut options = october();
        options.end_date = NaiveDate::from_ymd_opt(2018, 9, 30).unwrap();
        assert!(options.validate().is_err());

        assert!(october().with_max_api_calls(0).validate().is_err());

        let mut unnamed = october();
        unnamed.job_name = "  ".to_string();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_resume_false_starts_fresh() {
        assert!(october().with_resume(false).starts_fresh());
    }

    #[test]
    fn test_outcome_status_mapping() {
        assert_eq!(RunOutcome::Exhausted.final_status(), SyncStatus::Completed);
        assert_eq!(RunOutcome::EarlyExit.final_status(), SyncStatus::Completed);
        assert_eq!(RunOutcome::Failed.final_status(), SyncStatus::Error);
        assert_eq!(RunOutcome::Cancelled.final_status(), SyncStatus::Running);
        assert!(RunOutcome::EarlyExit.is_success());
        assert!(!RunOutcome::Cancelled.is_success());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunOutcome::EarlyExit).unwrap(),
            "\"early_exit\""
        );
        assert_eq!(FailureReason::ApiCallLimit.to_string(), "api_call_limit");
    }
}
