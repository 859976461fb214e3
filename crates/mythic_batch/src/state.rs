//! Durable run state.

use chrono::Utc;
use mythic_core::{Plan, RunState};
use mythic_error::{MythicResult, StorageError, StorageErrorKind};
use mythic_storage::{read_json, write_json};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const STATE_FILE: &str = "state.json";
const PLAN_FILE: &str = "plan.json";

/// Generate a run id from the current UTC time.
///
/// Ids look like `2025-03-14T09-26-53-589` and sort chronologically.
pub fn generate_run_id() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S-%3f").to_string()
}

/// Persists run state and plans under an artifact directory.
///
/// Each run owns `<artifact_dir>/<run_id>/`. Writes go through a temp file
/// and a rename, so a crash never leaves a torn `state.json`.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    artifact_dir: PathBuf,
}

impl RunStateStore {
    /// Create a store rooted at `artifact_dir`.
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Root of every run directory.
    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Directory of one run.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.artifact_dir.join(run_id)
    }

    /// Overwrite the persisted state of a run.
    #[instrument(skip(self, state), fields(run_id = %state.run_id(), phase = %state.phase()))]
    pub async fn save_state(&self, state: &RunState) -> MythicResult<()> {
        let path = self.run_dir(state.run_id()).join(STATE_FILE);
        write_json(&path, state).await?;
        debug!(path = %path.display(), "Saved run state");
        Ok(())
    }

    /// Load a run's state, or `None` if it was never saved.
    #[instrument(skip(self))]
    pub async fn load_state(&self, run_id: &str) -> MythicResult<Option<RunState>> {
        read_json(&self.run_dir(run_id).join(STATE_FILE)).await
    }

    /// Persist the plan a run executes.
    #[instrument(skip(self, plan), fields(run_id = %plan.run_id(), tasks = plan.tasks().len()))]
    pub async fn save_plan(&self, plan: &Plan) -> MythicResult<()> {
        write_json(&self.run_dir(plan.run_id()).join(PLAN_FILE), plan).await
    }

    /// Load a run's plan, or `None` if it was never saved.
    #[instrument(skip(self))]
    pub async fn load_plan(&self, run_id: &str) -> MythicResult<Option<Plan>> {
        read_json(&self.run_dir(run_id).join(PLAN_FILE)).await
    }

    /// Every run with a readable state file, newest first.
    ///
    /// Directories with a missing or corrupt state file are skipped.
    #[instrument(skip(self))]
    pub async fn list_runs(&self) -> MythicResult<Vec<RunState>> {
        let mut entries = match tokio::fs::read_dir(&self.artifact_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::new(StorageErrorKind::FileRead(format!(
                    "{}: {}",
                    self.artifact_dir.display(),
                    e
                )))
                .into());
            }
        };

        let mut run_ids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                run_ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        run_ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut runs = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            match self.load_state(&run_id).await {
                Ok(Some(state)) => runs.push(state),
                Ok(None) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable run state"),
            }
        }
        Ok(runs)
    }

    /// The newest run that has not reached a terminal phase.
    pub async fn most_recent_resumable(&self) -> MythicResult<Option<RunState>> {
        Ok(self
            .list_runs()
            .await?
            .into_iter()
            .find(RunState::is_resumable))
    }
}
