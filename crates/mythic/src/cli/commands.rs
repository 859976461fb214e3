//! CLI command definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Mythic - resumable batch imagery for worldbuilding content
#[derive(Parser, Debug)]
#[command(name = "mythic")]
#[command(about = "Resumable batch image generation and analysis", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Load configuration from this file instead of the default locations
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute (or resume) a plan
    Run {
        /// Path to the plan JSON file
        #[arg(long)]
        plan: PathBuf,

        /// Spool directory jobs are submitted to
        #[arg(long)]
        spool: PathBuf,

        /// Root of the character, location, and chapter directories
        #[arg(long)]
        content_root: PathBuf,

        /// Do not back up entity documents before modifying them
        #[arg(long)]
        no_backups: bool,
    },

    /// Show the state of a run (the most recent resumable run by default)
    Status {
        /// Run to show
        run_id: Option<String>,
    },

    /// List every run, newest first
    Runs,

    /// Show the dead-letter queue of a run
    Dlq {
        /// Run to inspect
        run_id: String,
    },

    /// Write a plan that retries the retryable failures of a run
    Retry {
        /// Run whose dead-letter queue is retried
        run_id: String,

        /// Where to write the new plan
        #[arg(long)]
        output: PathBuf,

        /// Attempts after which a failure counts as permanent
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Release the artifact lock held by a run
    Unlock {
        /// Run expected to hold the lock
        run_id: String,

        /// Remove the lock whoever holds it
        #[arg(long)]
        force: bool,
    },

    /// Print the report of a finished run
    Report {
        /// Run to report on
        run_id: String,
    },
}
