//! Final run report: counts, timing, failures.

use crate::{ApplyCounts, UploadStats};
use chrono::{DateTime, Utc};
use derive_getters::Getters;
use mythic_core::{JobInfo, JobState, Plan, RunPhase, RunState, TaskResult, TaskStatus};
use mythic_error::MythicResult;
use mythic_storage::{read_json, write_atomic, write_json};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const REPORT_JSON: &str = "report.json";
const REPORT_TEXT: &str = "report.txt";
const MAX_FAILURES_SHOWN: usize = 10;
const BAR_WIDTH: usize = 20;

/// Time spent per phase, in milliseconds. Phases never entered are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Getters)]
pub struct ReportTiming {
    staging_ms: Option<u64>,
    execution_ms: Option<u64>,
    applying_ms: Option<u64>,
    total_ms: u64,
}

/// Stage counters gathered while the run executed in this process.
///
/// A phase that was already finished when a resumed run started reports
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Getters)]
pub struct RunCounters {
    /// Reference staging statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staging: Option<UploadStats>,
    /// Apply pass counters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    applied: Option<ApplyCounts>,
}

impl RunCounters {
    /// Record the staging pass.
    pub fn record_staging(&mut self, stats: UploadStats) {
        self.staging = Some(stats);
    }

    /// Record the apply pass.
    pub fn record_apply(&mut self, counts: ApplyCounts) {
        self.applied = Some(counts);
    }
}

/// One failed task in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct ReportFailure {
    task_key: String,
    code: String,
    error: String,
    retryable: bool,
}

/// Summary of a finished (or failed) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct RunReport {
    run_id: String,
    phase: RunPhase,
    total_tasks: usize,
    success_count: usize,
    fail_count: usize,
    /// Skipped results plus targets the planner skipped as already generated
    skip_count: usize,
    timing: ReportTiming,
    failures: Vec<ReportFailure>,
    jobs: Vec<JobInfo>,
    #[serde(default)]
    counters: RunCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    generated_at: DateTime<Utc>,
}

fn span_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<u64> {
    let (start, end) = (start?, end?);
    (end - start).to_std().ok().map(|d| d.as_millis() as u64)
}

/// Assemble the report for a run from its plan, state, and task results.
pub fn generate_report(plan: &Plan, state: &RunState, results: &[TaskResult]) -> RunReport {
    let count = |status: TaskStatus| results.iter().filter(|r| *r.status() == status).count();
    let ts = state.timestamps();
    let finished = ts.finished();

    let timing = ReportTiming {
        staging_ms: span_ms(
            ts.entered(RunPhase::Staging),
            ts.entered(RunPhase::Staged).or(finished),
        ),
        execution_ms: span_ms(
            ts.entered(RunPhase::Running),
            ts.entered(RunPhase::Downloading).or(finished),
        ),
        applying_ms: span_ms(ts.entered(RunPhase::Applying), finished),
        total_ms: state.duration().as_millis() as u64,
    };

    let failures = results
        .iter()
        .filter(|r| *r.status() == TaskStatus::Failed)
        .map(|r| ReportFailure {
            task_key: r.task_key().clone(),
            code: r.error().as_ref().map(|e| e.code.clone()).unwrap_or_default(),
            error: r
                .error()
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retryable: r.error().as_ref().is_some_and(|e| e.retryable),
        })
        .collect();

    RunReport {
        run_id: state.run_id().clone(),
        phase: *state.phase(),
        total_tasks: *plan.summary().total_tasks(),
        success_count: count(TaskStatus::Success),
        fail_count: count(TaskStatus::Failed),
        skip_count: count(TaskStatus::Skipped) + plan.summary().skipped_already_generated(),
        timing,
        failures,
        jobs: state.jobs().clone(),
        counters: RunCounters::default(),
        error: state.error().clone(),
        generated_at: Utc::now(),
    }
}

impl RunReport {
    /// Attach the stage counters of the run.
    pub fn with_counters(mut self, counters: RunCounters) -> Self {
        self.counters = counters;
        self
    }
}

/// Write `report.json` and `report.txt` into the run directory.
///
/// Returns the path of the JSON report.
pub async fn save_report(run_dir: &Path, report: &RunReport) -> MythicResult<PathBuf> {
    let json_path = run_dir.join(REPORT_JSON);
    write_json(&json_path, report).await?;
    write_atomic(&run_dir.join(REPORT_TEXT), format_report(report).as_bytes()).await?;
    info!(path = %json_path.display(), "Saved run report");
    Ok(json_path)
}

/// Load a saved report, or `None` if the run never produced one.
pub async fn load_report(run_dir: &Path) -> MythicResult<Option<RunReport>> {
    read_json(&run_dir.join(REPORT_JSON)).await
}

/// Human-readable duration: `850ms`, `42s`, `3m 5s`, `2h 14m`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    let seconds = ms / 1000;
    if seconds < 60 {
        return format!("{}s", seconds);
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{}m {}s", minutes, seconds % 60);
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}

fn success_rate(report: &RunReport) -> f64 {
    if report.total_tasks == 0 {
        0.0
    } else {
        report.success_count as f64 / report.total_tasks as f64 * 100.0
    }
}

/// One-line summary: `3/4 tasks completed (75%) in 2m 5s`.
pub fn quick_summary(report: &RunReport) -> String {
    format!(
        "{}/{} tasks completed ({:.0}%) in {}",
        report.success_count,
        report.total_tasks,
        success_rate(report),
        format_duration(report.timing.total_ms)
    )
}

fn job_marker(state: &JobState) -> &'static str {
    match state {
        JobState::Succeeded => "[ok]",
        JobState::Failed => "[failed]",
        JobState::Cancelled => "[cancelled]",
        JobState::Running => "[running]",
        JobState::Pending => "[pending]",
    }
}

/// Render the report for the console and for `report.txt`.
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    let rule = "=".repeat(63);

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Batch run report: {}", report.run_id);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Status: {}", report.phase.to_string().to_uppercase());
    if let Some(error) = &report.error {
        let _ = writeln!(out, "Error: {}", error);
    }
    let _ = writeln!(out);

    let rate = success_rate(report);
    let filled = ((rate / 100.0) * BAR_WIDTH as f64).round() as usize;
    let _ = writeln!(
        out,
        "{}/{} succeeded",
        report.success_count, report.total_tasks
    );
    let _ = writeln!(
        out,
        "  [{}{}] {:.0}%",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled.min(BAR_WIDTH)),
        rate
    );
    let _ = writeln!(out, "  Failed:  {}", report.fail_count);
    let _ = writeln!(out, "  Skipped: {}", report.skip_count);
    let _ = writeln!(out);

    let _ = writeln!(out, "Timing:");
    let _ = writeln!(out, "  Total:     {}", format_duration(report.timing.total_ms));
    for (label, value) in [
        ("Staging:  ", report.timing.staging_ms),
        ("Execution:", report.timing.execution_ms),
        ("Applying: ", report.timing.applying_ms),
    ] {
        if let Some(ms) = value {
            let _ = writeln!(out, "  {} {}", label, format_duration(ms));
        }
    }

    if let Some(staging) = &report.counters.staging {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "References: {} uploaded, {} cached, {} failed ({} bytes)",
            staging.uploaded(),
            staging.cached(),
            staging.failed(),
            staging.total_bytes()
        );
    }
    if let Some(applied) = &report.counters.applied {
        if report.counters.staging.is_none() {
            let _ = writeln!(out);
        }
        let _ = writeln!(
            out,
            "Applied: {} images written, {} analyses merged, {} inventory entries",
            applied.images_written(),
            applied.yaml_updated(),
            applied.inventory_updated()
        );
    }

    if !report.jobs.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Jobs:");
        for job in &report.jobs {
            let _ = writeln!(
                out,
                "  {} {} ({} tasks, submitted {})",
                job_marker(job.state()),
                job.job_id(),
                job.task_count(),
                job.submitted_at().to_rfc3339()
            );
            if let Some(error) = job.error() {
                let _ = writeln!(out, "      {}", error);
            }
        }
    }

    if !report.failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Failures:");
        for failure in report.failures.iter().take(MAX_FAILURES_SHOWN) {
            let retry = if failure.retryable { " (retryable)" } else { "" };
            let _ = writeln!(out, "  x {}", failure.task_key);
            let _ = writeln!(out, "    {}: {}{}", failure.code, failure.error, retry);
        }
        if report.failures.len() > MAX_FAILURES_SHOWN {
            let _ = writeln!(
                out,
                "  ... and {} more failures",
                report.failures.len() - MAX_FAILURES_SHOWN
            );
        }
    }

    let _ = writeln!(out, "{}", rule);
    out
}
