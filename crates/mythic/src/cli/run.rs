//! Plan execution and retry planning handlers.

use mythic::{
    BatchConfig, BatchError, BatchErrorKind, BatchPipeline, FileSpoolBatchClient,
    FileSystemEntityStore, FileSystemReferenceStore, MythicResult, PipelineEvent,
    PipelineObserver, PipelineOutcome, Plan, RunStateStore, StorageError, StorageErrorKind,
    build_retry_plan, format_report, generate_run_id, load_dlq, quick_summary, read_json,
    write_json,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const STAGED_DIR: &str = "staged";

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::PhaseChanged { run_id, from, to } => {
            info!(run_id = %run_id, from = %from, to = %to, "Phase changed");
        }
        PipelineEvent::UploadProgress(progress) => {
            debug!(
                completed = progress.completed(),
                skipped = progress.skipped(),
                failed = progress.failed(),
                total = progress.total(),
                "Staging references"
            );
        }
        PipelineEvent::JobProgress(progress) => {
            info!(
                finished = progress.finished(),
                jobs = progress.jobs().len(),
                elapsed_s = progress.elapsed().as_secs(),
                "Waiting for jobs"
            );
        }
        PipelineEvent::Finished { run_id, phase } => {
            info!(run_id = %run_id, phase = %phase, "Run finished");
        }
    }
}

/// Execute (or resume) the plan at `plan_path` against a spool directory.
///
/// Returns whether the run completed.
#[tracing::instrument(skip(config))]
pub async fn run_plan(
    config: &BatchConfig,
    plan_path: &Path,
    spool: &Path,
    content_root: &Path,
    no_backups: bool,
) -> MythicResult<bool> {
    let plan: Plan = read_json(plan_path).await?.ok_or_else(|| {
        StorageError::new(StorageErrorKind::NotFound(plan_path.display().to_string()))
    })?;
    info!(run_id = %plan.run_id(), tasks = plan.tasks().len(), "Loaded plan");

    let config = config.clone().with_create_backups(*config.create_backups() && !no_backups);
    let client = Arc::new(FileSpoolBatchClient::new(spool)?);
    let references = Arc::new(FileSystemReferenceStore::new(
        config.artifact_dir().join(STAGED_DIR),
    )?);
    let entities = Arc::new(FileSystemEntityStore::new(content_root));

    let observer: Arc<dyn PipelineObserver> = Arc::new(log_event);
    let pipeline =
        BatchPipeline::from_config(&config, client, references, entities).with_observer(observer);

    match pipeline.execute(&plan).await? {
        PipelineOutcome::Locked(holder) => {
            eprintln!(
                "Artifact directory {} is locked by run {} (pid {} on {}, since {})",
                config.artifact_dir().display(),
                holder.run_id(),
                holder.pid(),
                holder.hostname(),
                holder.acquired_at().to_rfc3339()
            );
            eprintln!("Use `mythic unlock {} --force` if that run is gone.", holder.run_id());
            Ok(false)
        }
        PipelineOutcome::Completed(report) => {
            println!("{}", format_report(&report));
            println!("{}", quick_summary(&report));
            Ok(true)
        }
        PipelineOutcome::Failed { report, error } => {
            println!("{}", format_report(&report));
            eprintln!("Run {} failed: {}", plan.run_id(), error);
            Ok(false)
        }
    }
}

/// Write a plan retrying the retryable dead-lettered tasks of `run_id`.
///
/// Returns whether a plan was written.
#[tracing::instrument(skip(config))]
pub async fn write_retry_plan(
    config: &BatchConfig,
    run_id: &str,
    output: &Path,
    max_attempts: Option<u32>,
) -> MythicResult<bool> {
    let store = RunStateStore::new(config.artifact_dir().clone());
    if store.load_state(run_id).await?.is_none() {
        return Err(BatchError::new(BatchErrorKind::RunNotFound(run_id.to_string())).into());
    }

    let entries = load_dlq(&store.run_dir(run_id)).await?;
    let max_attempts = max_attempts.unwrap_or(*config.max_retries());
    let plan = build_retry_plan(&entries, &generate_run_id(), config, max_attempts);
    if plan.tasks().is_empty() {
        println!(
            "Nothing to retry in run {}: {} dead-lettered tasks, none retryable within {} attempts.",
            run_id,
            entries.len(),
            max_attempts
        );
        return Ok(false);
    }

    write_json(output, &plan).await?;
    println!(
        "Wrote retry plan {} with {} tasks to {}",
        plan.run_id(),
        plan.tasks().len(),
        output.display()
    );
    println!("Run it with: mythic run --plan {} ...", output.display());
    Ok(true)
}
