//! CLI runner - executes commands

use crate::cli::commands::{Cli, Commands, OutputFormat, RunArgs};
use crate::config::PipelineConfig;
use crate::engine::{ExtractionEngine, RunOutcome, RunReport};
use crate::error::{Error, Result};
use crate::http::SalesApiClient;
use crate::metrics::TracingSink;
use serde::Serialize;
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code of a cancelled run (128 + SIGINT)
const EXIT_CANCELLED: u8 = 130;

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<ExitCode> {
        match &self.cli.command {
            Commands::Run(args) => self.sync(args).await,
            Commands::Status { job } => self.status(job.as_deref()).await.map(|()| ExitCode::SUCCESS),
            Commands::Reset { job } => self.reset(job.as_deref()).await.map(|()| ExitCode::SUCCESS),
            Commands::Validate => self.validate().map(|()| ExitCode::SUCCESS),
        }
    }

    /// Load the pipeline file
    fn load_config(&self) -> Result<PipelineConfig> {
        PipelineConfig::from_file(&self.cli.config)
    }

    /// Execute a sync run
    async fn sync(&self, args: &RunArgs) -> Result<ExitCode> {
        let mut config = self.load_config()?;
        args.apply(&mut config)?;

        let store = config.checkpoint.open()?;
        let loader = config.loader.open()?;
        let client = SalesApiClient::new(config.api.clone())?;

        let engine = ExtractionEngine::new(Arc::new(client), store, loader)
            .with_retry(config.retry_policy())
            .with_chunking(config.chunking.clone())
            .with_page_size(config.api.page_size)
            .with_metrics(Arc::new(TracingSink));

        let token = engine.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping at the next safe point");
                token.cancel();
            }
        });

        if args.dry_run {
            info!("Dry run: records and checkpoints stay in memory");
        }
        let report = engine.run(&config.job).await?;
        self.output(&report)?;
        Ok(exit_code(&report))
    }

    /// Print one job or all jobs
    async fn status(&self, job: Option<&str>) -> Result<()> {
        let config = self.load_config()?;
        let store = config.checkpoint.open()?;

        match job {
            Some(name) => {
                let state = store.get_state(name).await?.ok_or_else(|| Error::JobNotFound {
                    job: name.to_string(),
                })?;
                self.output(&state)
            }
            None => self.output(&store.list_jobs().await?),
        }
    }

    /// Return a job to a fresh READY row
    async fn reset(&self, job: Option<&str>) -> Result<()> {
        let config = self.load_config()?;
        let store = config.checkpoint.open()?;
        let name = job.unwrap_or(&config.job.job_name);

        store.reset_job(name, &config.job.date_range()).await?;
        info!(job = name, window = %config.job.date_range(), "Checkpoint reset");

        let state = store.get_state(name).await?.ok_or_else(|| Error::JobNotFound {
            job: name.to_string(),
        })?;
        self.output(&state)
    }

    /// Validate the pipeline file
    fn validate(&self) -> Result<()> {
        let config = self.load_config()?;
        self.output(&json!({
            "valid": true,
            "job": config.job.job_name,
            "window": config.job.date_range().to_string(),
            "endpoint": config.api.endpoint_url()?.to_string(),
            "checkpoint": config.checkpoint,
            "loader": config.loader,
        }))
    }

    /// Output a document
    fn output<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = match self.cli.format {
            OutputFormat::Json => serde_json::to_string(value)?,
            OutputFormat::Pretty => serde_json::to_string_pretty(value)?,
        };
        println!("{text}");
        Ok(())
    }
}

/// Process exit code for a finished run
fn exit_code(report: &RunReport) -> ExitCode {
    match report.outcome {
        RunOutcome::Exhausted | RunOutcome::EarlyExit => ExitCode::SUCCESS,
        RunOutcome::Failed => ExitCode::FAILURE,
        RunOutcome::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn write_pipeline(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("pipeline.yaml");
        let yaml = format!(
            "job:\n  job_name: pos\n  start_date: 2018-10-01\n  end_date: 2018-10-31\n\
             api:\n  base_url: http://127.0.0.1:9/\n\
             checkpoint:\n  backend: file\n  path: {}\n",
            dir.join("checkpoints.json").display()
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }

    fn runner(args: &[&str]) -> Runner {
        Runner::new(Cli::try_parse_from(args).unwrap())
    }

    #[tokio::test]
    async fn test_validate_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pipeline(dir.path());
        let path = path.to_str().unwrap();

        runner(&["salesync", "-c", path, "validate"]).run().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_then_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pipeline(dir.path());
        let path = path.to_str().unwrap();

        runner(&["salesync", "-c", path, "reset"]).run().await.unwrap();
        runner(&["salesync", "-c", path, "status", "--job", "pos"])
            .run()
            .await
            .unwrap();

        let err = runner(&["salesync", "-c", path, "status", "--job", "other"])
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_pipeline_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        assert!(runner(&["salesync", "-c", path.to_str().unwrap(), "validate"])
            .run()
            .await
            .is_err());
    }
}
