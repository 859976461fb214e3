//! Persisted run state and the phase state machine.

use crate::{BatchConfig, Scope};
use chrono::{DateTime, Utc};
use mythic_error::{BatchError, BatchErrorKind, MythicResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Phases of a batch run, in execution order.
///
/// Transitions are strictly forward one step at a time. `Failed` is reachable
/// from every non-terminal phase.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumIter,
    derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// Tasks identified, plan persisted
    #[display("planned")]
    Planned,
    /// Reference images being staged
    #[display("staging")]
    Staging,
    /// References staged, ready for submission
    #[display("staged")]
    Staged,
    /// Jobs submitted and being polled
    #[display("running")]
    Running,
    /// Result files being downloaded
    #[display("downloading")]
    Downloading,
    /// Results being written into entity metadata
    #[display("applying")]
    Applying,
    /// Run finished
    #[display("completed")]
    Completed,
    /// Run aborted
    #[display("failed")]
    Failed,
}

impl RunPhase {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    /// The phase that normally follows this one.
    pub fn next(&self) -> Option<RunPhase> {
        match self {
            RunPhase::Planned => Some(RunPhase::Staging),
            RunPhase::Staging => Some(RunPhase::Staged),
            RunPhase::Staged => Some(RunPhase::Running),
            RunPhase::Running => Some(RunPhase::Downloading),
            RunPhase::Downloading => Some(RunPhase::Applying),
            RunPhase::Applying => Some(RunPhase::Completed),
            RunPhase::Completed | RunPhase::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        match next {
            RunPhase::Failed => !self.is_terminal(),
            _ => self.next() == Some(next),
        }
    }
}

/// Provider-side job state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum JobState {
    /// Queued at the provider
    #[serde(rename = "JOB_STATE_PENDING")]
    #[display("PENDING")]
    Pending,
    /// Being processed
    #[serde(rename = "JOB_STATE_RUNNING")]
    #[display("RUNNING")]
    Running,
    /// Finished with a result file
    #[serde(rename = "JOB_STATE_SUCCEEDED")]
    #[display("SUCCEEDED")]
    Succeeded,
    /// Finished without results
    #[serde(rename = "JOB_STATE_FAILED")]
    #[display("FAILED")]
    Failed,
    /// Cancelled before completion
    #[serde(rename = "JOB_STATE_CANCELLED")]
    #[display("CANCELLED")]
    Cancelled,
}

impl JobState {
    /// Whether polling can stop for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// A submitted provider job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct JobInfo {
    /// Provider job id
    job_id: String,
    /// Submission timestamp
    submitted_at: DateTime<Utc>,
    /// Index of the task partition this job covers
    chunk_index: usize,
    /// Number of tasks in the job
    task_count: usize,
    /// Keys of the tasks in the job
    #[serde(default)]
    task_keys: Vec<String>,
    /// Last polled state
    state: JobState,
    /// Provider error message, once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl JobInfo {
    /// Record a freshly submitted job.
    pub fn new(job_id: impl Into<String>, chunk_index: usize, task_keys: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at: Utc::now(),
            chunk_index,
            task_count: task_keys.len(),
            task_keys,
            state: JobState::Pending,
            error: None,
        }
    }
}

/// When each phase was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct PhaseTimestamps {
    /// Run state creation
    created: DateTime<Utc>,
    /// Plan persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    planned: Option<DateTime<Utc>>,
    /// Staging started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staging_started: Option<DateTime<Utc>>,
    /// Staging finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staged: Option<DateTime<Utc>>,
    /// Polling started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    running: Option<DateTime<Utc>>,
    /// Downloads started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    downloading_started: Option<DateTime<Utc>>,
    /// Apply started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    applying_started: Option<DateTime<Utc>>,
    /// Run completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed: Option<DateTime<Utc>>,
    /// Run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed: Option<DateTime<Utc>>,
}

impl PhaseTimestamps {
    fn new(created: DateTime<Utc>) -> Self {
        Self {
            created,
            planned: Some(created),
            staging_started: None,
            staged: None,
            running: None,
            downloading_started: None,
            applying_started: None,
            completed: None,
            failed: None,
        }
    }

    fn record(&mut self, phase: RunPhase, at: DateTime<Utc>) {
        let slot = match phase {
            RunPhase::Planned => &mut self.planned,
            RunPhase::Staging => &mut self.staging_started,
            RunPhase::Staged => &mut self.staged,
            RunPhase::Running => &mut self.running,
            RunPhase::Downloading => &mut self.downloading_started,
            RunPhase::Applying => &mut self.applying_started,
            RunPhase::Completed => &mut self.completed,
            RunPhase::Failed => &mut self.failed,
        };
        *slot = Some(at);
    }

    /// When a phase was entered, if it has been.
    pub fn entered(&self, phase: RunPhase) -> Option<DateTime<Utc>> {
        match phase {
            RunPhase::Planned => self.planned,
            RunPhase::Staging => self.staging_started,
            RunPhase::Staged => self.staged,
            RunPhase::Running => self.running,
            RunPhase::Downloading => self.downloading_started,
            RunPhase::Applying => self.applying_started,
            RunPhase::Completed => self.completed,
            RunPhase::Failed => self.failed,
        }
    }

    /// When the run reached a terminal phase.
    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.completed.or(self.failed)
    }
}

/// The mutable record of one plan's execution.
///
/// Owned by the orchestrator and persisted after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct RunState {
    /// Run identifier
    run_id: String,
    /// Current phase
    phase: RunPhase,
    /// Scope the plan was built for
    scope: Scope,
    /// Phase entry timestamps
    timestamps: PhaseTimestamps,
    /// Submitted jobs
    jobs: Vec<JobInfo>,
    /// Terminal error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Configuration in force when the run started
    config_snapshot: BatchConfig,
}

impl RunState {
    /// Create a run in the `planned` phase.
    pub fn new(run_id: impl Into<String>, scope: Scope, config_snapshot: BatchConfig) -> Self {
        Self {
            run_id: run_id.into(),
            phase: RunPhase::Planned,
            scope,
            timestamps: PhaseTimestamps::new(Utc::now()),
            jobs: Vec::new(),
            error: None,
            config_snapshot,
        }
    }

    /// Move to the next phase.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the state machine forbids the change.
    pub fn advance(&mut self, next: RunPhase) -> MythicResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(BatchError::new(BatchErrorKind::InvalidTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            })
            .into());
        }
        debug!(run_id = %self.run_id, from = %self.phase, to = %next, "Advancing run phase");
        self.phase = next;
        self.timestamps.record(next, Utc::now());
        Ok(())
    }

    /// Move to `failed` and record the reason.
    ///
    /// A run that already finished keeps its terminal phase.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.phase.is_terminal() {
            debug!(run_id = %self.run_id, phase = %self.phase, "Run already terminal, not marking failed");
            return;
        }
        self.phase = RunPhase::Failed;
        self.timestamps.record(RunPhase::Failed, Utc::now());
        self.error = Some(message);
    }

    /// Record a newly submitted job.
    pub fn add_job(&mut self, job: JobInfo) {
        self.jobs.push(job);
    }

    /// Whether a job covering the given partition is already recorded.
    pub fn has_chunk(&self, chunk_index: usize) -> bool {
        self.jobs.iter().any(|j| j.chunk_index == chunk_index)
    }

    /// Update a job's polled state. Returns false if the job is unknown.
    pub fn set_job_state(&mut self, job_id: &str, state: JobState, error: Option<String>) -> bool {
        match self.jobs.iter_mut().find(|j| j.job_id == job_id) {
            Some(job) => {
                job.state = state;
                if error.is_some() {
                    job.error = error;
                }
                true
            }
            None => false,
        }
    }

    /// Whether every recorded job has reached a terminal state.
    pub fn all_jobs_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.state.is_terminal())
    }

    /// Whether the run can be picked up again.
    pub fn is_resumable(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Wall-clock duration from creation to finish, or to now if still running.
    pub fn duration(&self) -> Duration {
        let end = self.timestamps.finished().unwrap_or_else(Utc::now);
        (end - self.timestamps.created)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RunState {
        RunState::new("run-1", Scope::default(), BatchConfig::default())
    }

    #[test]
    fn forward_transitions_follow_sequence() {
        let mut run = state();
        for phase in [
            RunPhase::Staging,
            RunPhase::Staged,
            RunPhase::Running,
            RunPhase::Downloading,
            RunPhase::Applying,
            RunPhase::Completed,
        ] {
            run.advance(phase).unwrap();
            assert_eq!(*run.phase(), phase);
            assert!(run.timestamps().entered(phase).is_some());
        }
    }

    #[test]
    fn skipping_or_reversing_is_rejected() {
        let mut run = state();
        assert!(run.advance(RunPhase::Running).is_err());
        run.advance(RunPhase::Staging).unwrap();
        assert!(run.advance(RunPhase::Planned).is_err());
        assert!(run.advance(RunPhase::Staging).is_err());
    }

    #[test]
    fn failed_reachable_from_any_non_terminal_phase() {
        let mut run = state();
        run.advance(RunPhase::Staging).unwrap();
        run.advance(RunPhase::Failed).unwrap();
        assert!(run.phase().is_terminal());
        assert!(run.advance(RunPhase::Failed).is_err());
    }

    #[test]
    fn mark_failed_keeps_completed_runs() {
        let mut run = state();
        for phase in [
            RunPhase::Staging,
            RunPhase::Staged,
            RunPhase::Running,
            RunPhase::Downloading,
            RunPhase::Applying,
            RunPhase::Completed,
        ] {
            run.advance(phase).unwrap();
        }
        run.mark_failed("late error");
        assert_eq!(*run.phase(), RunPhase::Completed);
        assert!(run.error().is_none());
    }

    #[test]
    fn job_tracking() {
        let mut run = state();
        run.add_job(JobInfo::new("J1", 0, vec!["a".into(), "b".into()]));
        assert!(run.has_chunk(0));
        assert!(!run.has_chunk(1));
        assert!(!run.all_jobs_terminal());
        assert!(run.set_job_state("J1", JobState::Succeeded, None));
        assert!(!run.set_job_state("J2", JobState::Failed, None));
        assert!(run.all_jobs_terminal());
        assert_eq!(*run.jobs()[0].task_count(), 2);
    }

    #[test]
    fn job_state_wire_names() {
        let json = serde_json::to_string(&JobState::Succeeded).unwrap();
        assert_eq!(json, "\"JOB_STATE_SUCCEEDED\"");
        assert_eq!(JobState::Succeeded.to_string(), "SUCCEEDED");
    }
}
