//! Dead-letter queue persistence and explicit retry planning.

use mythic_core::{BatchConfig, DlqEntry, Plan, Scope, Task};
use mythic_error::{MythicResult, StorageError, StorageErrorKind};
use mythic_storage::{read_json, write_json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

const DLQ_DIR: &str = "failed";
const MAX_SHOWN: usize = 5;

/// Aggregate counts over DLQ entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, derive_getters::Getters)]
pub struct DlqStats {
    /// Entries considered
    total: usize,
    /// Entries that may be retried
    retryable: usize,
    /// Entries that will not be retried
    permanent: usize,
    /// Entries per error code
    by_code: BTreeMap<String, usize>,
}

fn dlq_file_name(sequence: usize) -> String {
    if sequence <= 1 {
        "dlq.json".to_string()
    } else {
        format!("dlq-{}.json", sequence)
    }
}

fn dlq_sequence(file_name: &str) -> Option<usize> {
    if file_name == "dlq.json" {
        return Some(1);
    }
    file_name
        .strip_prefix("dlq-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Persist DLQ entries under `<run_dir>/failed/`.
///
/// Writes nothing for an empty slice. The first write is `dlq.json`; later
/// writes pick the next free `dlq-N.json`, so earlier files are never
/// rewritten. Returns the written path.
#[instrument(skip(entries), fields(entries = entries.len()))]
pub async fn write_dlq(run_dir: &Path, entries: &[DlqEntry]) -> MythicResult<Option<PathBuf>> {
    if entries.is_empty() {
        return Ok(None);
    }
    let dir = run_dir.join(DLQ_DIR);
    let mut sequence = 1;
    let path = loop {
        let candidate = dir.join(dlq_file_name(sequence));
        let exists = tokio::fs::try_exists(&candidate).await.map_err(|e| {
            StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                candidate.display(),
                e
            )))
        })?;
        if !exists {
            break candidate;
        }
        sequence += 1;
    };

    write_json(&path, &entries).await?;
    info!(path = %path.display(), "Wrote dead-letter queue");
    Ok(Some(path))
}

/// Load every DLQ file of a run, oldest first.
///
/// When a task appears in several files the latest entry wins, keeping the
/// position of its first appearance.
pub async fn load_dlq(run_dir: &Path) -> MythicResult<Vec<DlqEntry>> {
    let dir = run_dir.join(DLQ_DIR);
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                dir.display(),
                e
            )))
            .into());
        }
    };

    let mut files = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
        StorageError::new(StorageErrorKind::FileRead(format!("{}: {}", dir.display(), e)))
    })? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(sequence) = dlq_sequence(&name) {
            files.push((sequence, entry.path()));
        }
    }
    files.sort();

    let mut merged: Vec<DlqEntry> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (_, path) in files {
        let entries: Vec<DlqEntry> = read_json(&path).await?.unwrap_or_default();
        debug!(path = %path.display(), entries = entries.len(), "Loaded DLQ file");
        for entry in entries {
            match positions.get(entry.task_key()) {
                Some(&i) => merged[i] = entry,
                None => {
                    positions.insert(entry.task_key().to_string(), merged.len());
                    merged.push(entry);
                }
            }
        }
    }
    Ok(merged)
}

/// Entries that are retryable and have attempts left.
pub fn retryable_entries(entries: &[DlqEntry], max_attempts: u32) -> Vec<&DlqEntry> {
    entries
        .iter()
        .filter(|e| e.error().retryable && e.error().attempts < max_attempts)
        .collect()
}

/// Entries that will not be retried: terminal errors or exhausted attempts.
pub fn permanent_failures(entries: &[DlqEntry], max_attempts: u32) -> Vec<&DlqEntry> {
    entries
        .iter()
        .filter(|e| !e.error().retryable || e.error().attempts >= max_attempts)
        .collect()
}

/// Counts by retry class and error code.
pub fn dlq_stats(entries: &[DlqEntry], max_attempts: u32) -> DlqStats {
    let mut by_code = BTreeMap::new();
    for entry in entries {
        *by_code.entry(entry.error().code.clone()).or_insert(0) += 1;
    }
    let retryable = retryable_entries(entries, max_attempts).len();
    DlqStats {
        total: entries.len(),
        retryable,
        permanent: entries.len() - retryable,
        by_code,
    }
}

/// Render entries for the terminal.
pub fn format_dlq_for_console(entries: &[DlqEntry], max_attempts: u32) -> String {
    if entries.is_empty() {
        return "Dead letter queue is empty.".to_string();
    }

    let stats = dlq_stats(entries, max_attempts);
    let mut out = String::new();
    let _ = writeln!(out, "Dead letter queue: {} failed tasks", stats.total);
    let _ = writeln!(out, "  Retryable: {}", stats.retryable);
    let _ = writeln!(out, "  Permanent: {}", stats.permanent);
    let _ = writeln!(out);
    let _ = writeln!(out, "Errors by code:");
    for (code, count) in &stats.by_code {
        let _ = writeln!(out, "  {}: {}", code, count);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Recent failures:");
    for entry in entries.iter().take(MAX_SHOWN) {
        let error = entry.error();
        let _ = writeln!(out, "  - {}", entry.task_key());
        let _ = writeln!(out, "    {}: {}", error.code, error.message);
        let _ = writeln!(
            out,
            "    Attempts: {}, last: {}",
            error.attempts,
            error.last_attempt_at.to_rfc3339()
        );
    }
    if entries.len() > MAX_SHOWN {
        let _ = writeln!(out, "  ... and {} more", entries.len() - MAX_SHOWN);
    }
    out
}

/// Build a new plan from the retryable entries of a DLQ.
///
/// Attempt counts carry over, so failures in the new run are recorded with
/// their cumulative attempt number. Returns a plan with no tasks when nothing
/// is retryable.
pub fn build_retry_plan(
    entries: &[DlqEntry],
    new_run_id: &str,
    config: &BatchConfig,
    max_attempts: u32,
) -> Plan {
    let mut tasks: Vec<Task> = Vec::new();
    let mut prior_attempts = HashMap::new();
    for entry in retryable_entries(entries, max_attempts) {
        if prior_attempts
            .insert(entry.task_key().to_string(), entry.error().attempts)
            .is_none()
        {
            tasks.push(entry.task().clone());
        }
    }

    let entity_types: BTreeSet<_> = tasks.iter().map(|t| *t.entity_type()).collect();
    let kinds: BTreeSet<_> = tasks.iter().map(|t| *t.kind()).collect();
    let slugs: BTreeSet<_> = tasks.iter().map(|t| t.entity_slug().clone()).collect();
    let scope = Scope {
        entity_types: entity_types.into_iter().collect(),
        entity_filter: Some(slugs.into_iter().collect()),
        kinds: kinds.into_iter().collect(),
    };

    info!(run_id = new_run_id, tasks = tasks.len(), "Built retry plan");
    Plan::new(new_run_id, scope, config.clone(), tasks, 0).with_prior_attempts(prior_attempts)
}
