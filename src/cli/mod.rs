//! CLI module
//!
//! Command-line interface for running sales syncs.
//!
//! # Commands
//!
//! - `run` - Extract the configured window, resuming from the checkpoint
//! - `status` - Print stored checkpoints
//! - `reset` - Discard a job's progress
//! - `validate` - Check a pipeline file

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat, RunArgs};
pub use runner::Runner;
