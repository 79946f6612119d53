//! CLI commands and argument parsing

use crate::config::{CheckpointConfig, LoaderConfig, PipelineConfig};
use crate::error::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Chunked, resumable sales extraction
#[derive(Parser, Debug)]
#[command(name = "salesync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline file (YAML)
    #[arg(short, long, global = true, default_value = "salesync.yaml")]
    pub config: PathBuf,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract sales for the configured window
    Run(RunArgs),

    /// Show stored checkpoints
    Status {
        /// Only this job (default: all jobs)
        #[arg(long)]
        job: Option<String>,
    },

    /// Discard a job's progress so the next run starts over
    Reset {
        /// Job to reset (default: the configured job)
        #[arg(long)]
        job: Option<String>,
    },

    /// Parse and validate the pipeline file
    Validate,
}

/// Overrides for a single run
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Continue from the stored cursor
    #[arg(long, conflicts_with = "no_resume")]
    pub resume: bool,

    /// Ignore the stored cursor and start over
    #[arg(long)]
    pub no_resume: bool,

    /// Reset the checkpoint before running
    #[arg(long)]
    pub force_restart: bool,

    /// First day of the window (YYYY-MM-DD)
    #[arg(long)]
    pub start_date: Option<NaiveDate>,

    /// Last day of the window (YYYY-MM-DD)
    #[arg(long)]
    pub end_date: Option<NaiveDate>,

    /// Smallest chunk in pages
    #[arg(long)]
    pub chunk_min: Option<u32>,

    /// Largest chunk in pages
    #[arg(long)]
    pub chunk_max: Option<u32>,

    /// Ceiling on HTTP calls for this run
    #[arg(long)]
    pub max_api_calls: Option<u64>,

    /// Checkpoint job name
    #[arg(long)]
    pub job_name: Option<String>,

    /// Keep going past the end of the window
    #[arg(long)]
    pub no_early_exit: bool,

    /// Keep records and checkpoints in memory only
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Apply the overrides and re-validate
    pub fn apply(&self, config: &mut PipelineConfig) -> Result<()> {
        let job = &mut config.job;
        if self.resume {
            job.resume = true;
        }
        if self.no_resume {
            job.resume = false;
        }
        if self.force_restart {
            job.force_restart = true;
        }
        if let Some(start) = self.start_date {
            job.start_date = start;
        }
        if let Some(end) = self.end_date {
            job.end_date = end;
        }
        if let Some(max) = self.max_api_calls {
            job.max_api_calls = max;
        }
        if let Some(name) = &self.job_name {
            job.job_name.clone_from(name);
        }
        if self.no_early_exit {
            job.enable_early_exit = false;
        }

        if let Some(min) = self.chunk_min {
            config.chunking.min_pages = min;
        }
        if let Some(max) = self.chunk_max {
            config.chunking.max_pages = max;
        }

        if self.dry_run {
            config.checkpoint = CheckpointConfig::Memory;
            config.loader = LoaderConfig::Memory;
        }

        config.validate()
    }
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Compact JSON, one document per line
    Json,
    /// Indented JSON
    Pretty,
}
