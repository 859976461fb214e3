//! In-memory batch provider.

use super::{image_line, text_line};
use async_trait::async_trait;
use mythic_core::{JobState, Task, TaskKind};
use mythic_error::{MythicResult, ProviderError, ProviderErrorKind};
use mythic_interface::{BatchClient, JobHandle, JobStatus, SubmitRequest};
use mythic_storage::write_atomic;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Produces the result line for a task.
pub type Responder = Arc<dyn Fn(&Task) -> String + Send + Sync>;

struct MockJob {
    tasks: Vec<Task>,
    polls: usize,
    cancelled: bool,
}

/// Mock batch client.
///
/// Jobs are named `J1`, `J2`, ... in submission order. Each job reports
/// RUNNING for `running_polls` polls, then `final_state`.
pub struct MockBatchClient {
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    submit_count: Arc<Mutex<usize>>,
    poll_count: Arc<Mutex<usize>>,
    download_count: Arc<Mutex<usize>>,
    responder: Responder,
    extra_lines: Vec<String>,
    running_polls: usize,
    final_state: JobState,
    fail_submit_at: Option<usize>,
}

impl MockBatchClient {
    /// Images for generate tasks, a short text for analyze tasks.
    pub fn new() -> Self {
        Self::with_responder(Arc::new(|task: &Task| match task.kind() {
            TaskKind::Generate => image_line(task.key()),
            TaskKind::Analyze => text_line(task.key(), "Tall, with a weathered face."),
        }))
    }

    /// Answer every task with `responder`.
    pub fn with_responder(responder: Responder) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            submit_count: Arc::new(Mutex::new(0)),
            poll_count: Arc::new(Mutex::new(0)),
            download_count: Arc::new(Mutex::new(0)),
            responder,
            extra_lines: Vec::new(),
            running_polls: 1,
            final_state: JobState::Succeeded,
            fail_submit_at: None,
        }
    }

    /// Append raw lines to every result file.
    pub fn with_extra_lines(mut self, lines: Vec<String>) -> Self {
        self.extra_lines = lines;
        self
    }

    /// Terminal state every job ends in.
    pub fn with_final_state(mut self, state: JobState) -> Self {
        self.final_state = state;
        self
    }

    /// Polls that report RUNNING before the terminal state.
    pub fn with_running_polls(mut self, polls: usize) -> Self {
        self.running_polls = polls;
        self
    }

    /// Reject the submission with this 1-based number.
    pub fn with_failing_submit(mut self, submission: usize) -> Self {
        self.fail_submit_at = Some(submission);
        self
    }

    /// Number of successful submissions.
    pub fn submit_count(&self) -> usize {
        *self.submit_count.lock().unwrap()
    }

    /// Number of polls.
    pub fn poll_count(&self) -> usize {
        *self.poll_count.lock().unwrap()
    }

    /// Number of result downloads.
    pub fn download_count(&self) -> usize {
        *self.download_count.lock().unwrap()
    }

    /// Task count of a submitted job.
    pub fn job_task_count(&self, job_id: &str) -> Option<usize> {
        self.jobs.lock().unwrap().get(job_id).map(|j| j.tasks.len())
    }

    /// Whether a job was cancelled.
    pub fn was_cancelled(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .is_some_and(|j| j.cancelled)
    }
}

#[async_trait]
impl BatchClient for MockBatchClient {
    async fn submit(&self, request: &SubmitRequest<'_>) -> MythicResult<JobHandle> {
        let mut count = self.submit_count.lock().unwrap();
        if self.fail_submit_at == Some(*count + 1) {
            return Err(ProviderError::http(400, "malformed batch").into());
        }
        *count += 1;
        let job_id = format!("J{}", *count);
        self.jobs.lock().unwrap().insert(
            job_id.clone(),
            MockJob {
                tasks: request.tasks.to_vec(),
                polls: 0,
                cancelled: false,
            },
        );
        Ok(JobHandle { job_id })
    }

    async fn poll(&self, job_id: &str) -> MythicResult<JobStatus> {
        *self.poll_count.lock().unwrap() += 1;
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(job_id).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::UnknownJob(job_id.to_string()))
        })?;
        if job.cancelled {
            return Ok(JobStatus::new(JobState::Cancelled));
        }
        job.polls += 1;
        if job.polls <= self.running_polls {
            return Ok(JobStatus::new(JobState::Running));
        }
        Ok(match self.final_state {
            JobState::Failed => JobStatus::failed("quota exceeded"),
            state => JobStatus::new(state),
        })
    }

    async fn download_results(&self, job_id: &str, dest: &Path) -> MythicResult<PathBuf> {
        *self.download_count.lock().unwrap() += 1;
        let body = {
            let jobs = self.jobs.lock().unwrap();
            let job = jobs.get(job_id).ok_or_else(|| {
                ProviderError::new(ProviderErrorKind::UnknownJob(job_id.to_string()))
            })?;
            let mut lines: Vec<String> = job.tasks.iter().map(|t| (self.responder)(t)).collect();
            lines.extend(self.extra_lines.iter().cloned());
            lines.join("\n") + "\n"
        };
        write_atomic(dest, body.as_bytes()).await?;
        Ok(dest.to_path_buf())
    }

    async fn cancel(&self, job_id: &str) -> MythicResult<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(job_id) {
            job.cancelled = true;
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}
