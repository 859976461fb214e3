//! Run inspection handlers: status, runs, DLQ, reports, locks.

use mythic::{
    BatchConfig, BatchError, BatchErrorKind, MythicResult, RunState, RunStateStore, check_lock,
    force_release_lock, format_dlq_for_console, format_duration, format_report, load_dlq,
    load_report, release_lock,
};
use tracing::warn;

fn store(config: &BatchConfig) -> RunStateStore {
    RunStateStore::new(config.artifact_dir().clone())
}

async fn require_state(store: &RunStateStore, run_id: &str) -> MythicResult<RunState> {
    store
        .load_state(run_id)
        .await?
        .ok_or_else(|| BatchError::new(BatchErrorKind::RunNotFound(run_id.to_string())).into())
}

fn print_state(state: &RunState) {
    println!("Run:      {}", state.run_id());
    println!("Phase:    {}", state.phase());
    println!("Created:  {}", state.timestamps().created().to_rfc3339());
    println!(
        "Duration: {}",
        format_duration(state.duration().as_millis() as u64)
    );
    if let Some(error) = state.error() {
        println!("Error:    {}", error);
    }
    if state.jobs().is_empty() {
        println!("Jobs:     none submitted");
        return;
    }
    println!("Jobs:");
    for job in state.jobs() {
        println!(
            "  #{} {} {} ({} tasks)",
            job.chunk_index(),
            job.job_id(),
            job.state(),
            job.task_count()
        );
        if let Some(error) = job.error() {
            println!("      {}", error);
        }
    }
}

/// Show one run, or the most recent resumable run.
pub async fn show_status(config: &BatchConfig, run_id: Option<&str>) -> MythicResult<bool> {
    let store = store(config);
    let state = match run_id {
        Some(run_id) => require_state(&store, run_id).await?,
        None => match store.most_recent_resumable().await? {
            Some(state) => state,
            None => {
                println!("No resumable runs in {}", config.artifact_dir().display());
                return Ok(true);
            }
        },
    };
    print_state(&state);

    match check_lock(store.artifact_dir()) {
        Ok(Some(holder)) => println!(
            "Lock:     held by {} (pid {} on {})",
            holder.run_id(),
            holder.pid(),
            holder.hostname()
        ),
        Ok(None) => println!("Lock:     free"),
        Err(e) => warn!(error = %e, "Lock file is unreadable"),
    }
    Ok(true)
}

/// List every run, newest first.
pub async fn show_runs(config: &BatchConfig) -> MythicResult<bool> {
    let runs = store(config).list_runs().await?;
    if runs.is_empty() {
        println!("No runs in {}", config.artifact_dir().display());
        return Ok(true);
    }
    for run in &runs {
        println!(
            "{:<26} {:<12} {:>3} jobs  {}",
            run.run_id(),
            run.phase().to_string(),
            run.jobs().len(),
            format_duration(run.duration().as_millis() as u64)
        );
    }
    Ok(true)
}

/// Print a run's dead-letter queue.
pub async fn show_dlq(config: &BatchConfig, run_id: &str) -> MythicResult<bool> {
    let store = store(config);
    require_state(&store, run_id).await?;
    let entries = load_dlq(&store.run_dir(run_id)).await?;
    println!("{}", format_dlq_for_console(&entries, *config.max_retries()));
    Ok(true)
}

/// Print a run's saved report.
pub async fn show_report(config: &BatchConfig, run_id: &str) -> MythicResult<bool> {
    let store = store(config);
    match load_report(&store.run_dir(run_id)).await? {
        Some(report) => {
            println!("{}", format_report(&report));
            Ok(true)
        }
        None => {
            let state = require_state(&store, run_id).await?;
            println!(
                "Run {} has no report yet (phase {})",
                run_id,
                state.phase()
            );
            Ok(false)
        }
    }
}

/// Release the artifact lock.
///
/// Without `force`, only a lock held by `run_id` (or an unreadable one) is removed.
pub async fn unlock(config: &BatchConfig, run_id: &str, force: bool) -> MythicResult<bool> {
    let dir = config.artifact_dir();
    if force {
        if force_release_lock(dir)? {
            println!("Removed lock in {}", dir.display());
        } else {
            println!("No lock in {}", dir.display());
        }
        return Ok(true);
    }

    match check_lock(dir) {
        Ok(None) => {
            println!("No lock in {}", dir.display());
            Ok(true)
        }
        Ok(Some(holder)) if holder.run_id() != run_id => {
            eprintln!(
                "Lock is held by run {} (pid {} on {}), not {}. Use --force to remove it anyway.",
                holder.run_id(),
                holder.pid(),
                holder.hostname(),
                run_id
            );
            Ok(false)
        }
        _ => {
            release_lock(dir, run_id)?;
            println!("Released lock of run {}", run_id);
            Ok(true)
        }
    }
}
