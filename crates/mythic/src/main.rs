//! Mythic CLI binary.
//!
//! This binary provides command-line access to the batch pipeline:
//! - Execute or resume plans against a spool directory
//! - Inspect runs, reports, and dead-letter queues
//! - Build retry plans and clear stale locks

use clap::Parser;
use std::process::ExitCode;

mod cli;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    use cli::{
        Cli, Commands, load_config, run_plan, show_dlq, show_report, show_runs, show_status,
        unlock, write_retry_plan,
    };

    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    mythic::telemetry::init_console_telemetry(cli.verbose)?;
    let config = load_config(cli.config.as_deref())?;

    let ok = match cli.command {
        Commands::Run {
            plan,
            spool,
            content_root,
            no_backups,
        } => run_plan(&config, &plan, &spool, &content_root, no_backups).await?,
        Commands::Status { run_id } => show_status(&config, run_id.as_deref()).await?,
        Commands::Runs => show_runs(&config).await?,
        Commands::Dlq { run_id } => show_dlq(&config, &run_id).await?,
        Commands::Retry {
            run_id,
            output,
            max_attempts,
        } => write_retry_plan(&config, &run_id, &output, max_attempts).await?,
        Commands::Unlock { run_id, force } => unlock(&config, &run_id, force).await?,
        Commands::Report { run_id } => show_report(&config, &run_id).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
