//! Job polling and result download.

use crate::RunStateStore;
use mythic_core::{JobInfo, JobState, RunState};
use mythic_error::MythicResult;
use mythic_interface::BatchClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Snapshot passed to the progress callback on every poll tick.
#[derive(Debug, Clone, PartialEq, derive_getters::Getters)]
pub struct JobProgress {
    /// Every job, not only the ones that changed
    jobs: Vec<JobInfo>,
    /// Time since polling started
    elapsed: Duration,
    /// Poll tick, starting at 1
    tick: u64,
}

impl JobProgress {
    /// Jobs that reached a terminal state.
    pub fn finished(&self) -> usize {
        self.jobs.iter().filter(|j| j.state().is_terminal()).count()
    }
}

/// Result files collected after polling.
#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    /// Downloaded (or reused) result files, in chunk order
    pub files: Vec<PathBuf>,
    /// Jobs that produced no file, and why
    pub errors: Vec<String>,
}

/// Name of the result file for a chunk.
///
/// Chunk 0 writes `results.jsonl`; chunk `n` writes `results-{n+1}.jsonl`.
pub fn result_file_name(chunk_index: usize) -> String {
    if chunk_index == 0 {
        "results.jsonl".to_string()
    } else {
        format!("results-{}.jsonl", chunk_index + 1)
    }
}

/// Polls recorded jobs to completion and fetches their results.
pub struct JobExecutor {
    client: Arc<dyn BatchClient>,
    store: RunStateStore,
    poll_interval: Duration,
}

impl JobExecutor {
    /// Create an executor.
    pub fn new(client: Arc<dyn BatchClient>, store: RunStateStore, poll_interval: Duration) -> Self {
        Self {
            client,
            store,
            poll_interval,
        }
    }

    /// Poll until every job in `state` is terminal.
    ///
    /// Each tick polls the non-terminal jobs, writes their states back into
    /// `state`, persists it, and reports a full snapshot. A failed poll is
    /// logged and retried on the next tick. There is no internal deadline;
    /// wrap the call in `tokio::time::timeout` to bound it.
    #[instrument(skip_all, fields(run_id = %state.run_id(), jobs = state.jobs().len()))]
    pub async fn poll_until_terminal<F>(
        &self,
        state: &mut RunState,
        mut on_progress: F,
    ) -> MythicResult<()>
    where
        F: FnMut(&JobProgress) + Send,
    {
        let started = Instant::now();
        let mut tick = 0u64;

        loop {
            tick += 1;

            let pending: Vec<String> = state
                .jobs()
                .iter()
                .filter(|j| !j.state().is_terminal())
                .map(|j| j.job_id().clone())
                .collect();

            for job_id in pending {
                match self.client.poll(&job_id).await {
                    Ok(status) => {
                        debug!(job_id = %job_id, state = %status.state, "Polled job");
                        state.set_job_state(&job_id, status.state, status.error);
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Poll failed, retrying next tick");
                    }
                }
            }

            self.store.save_state(state).await?;

            let progress = JobProgress {
                jobs: state.jobs().clone(),
                elapsed: started.elapsed(),
                tick,
            };
            on_progress(&progress);

            if state.all_jobs_terminal() {
                info!(tick, elapsed_ms = started.elapsed().as_millis() as u64, "All jobs terminal");
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Download the result file of every succeeded job into the run directory.
    ///
    /// A file left by an interrupted run is reused. Failed or cancelled jobs,
    /// and downloads that fail, are reported in
    /// [`DownloadOutcome::errors`] without stopping the other jobs.
    #[instrument(skip_all, fields(run_id = %state.run_id()))]
    pub async fn download_results(&self, state: &RunState) -> MythicResult<DownloadOutcome> {
        let run_dir = self.store.run_dir(state.run_id());
        let mut outcome = DownloadOutcome::default();

        let mut jobs: Vec<&JobInfo> = state.jobs().iter().collect();
        jobs.sort_by_key(|j| *j.chunk_index());

        for job in jobs {
            match job.state() {
                JobState::Succeeded => {
                    let dest = run_dir.join(result_file_name(*job.chunk_index()));
                    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                        debug!(job_id = %job.job_id(), path = %dest.display(), "Reusing downloaded results");
                        outcome.files.push(dest);
                        continue;
                    }
                    match self.client.download_results(job.job_id(), &dest).await {
                        Ok(path) => {
                            info!(job_id = %job.job_id(), path = %path.display(), "Downloaded results");
                            outcome.files.push(path);
                        }
                        Err(e) => {
                            warn!(job_id = %job.job_id(), error = %e, "Failed to download results");
                            outcome
                                .errors
                                .push(format!("Failed to download results for job {}: {}", job.job_id(), e));
                        }
                    }
                }
                terminal @ (JobState::Failed | JobState::Cancelled) => {
                    let reason = job.error().clone().unwrap_or_else(|| terminal.to_string());
                    warn!(job_id = %job.job_id(), reason = %reason, "Job produced no results");
                    outcome
                        .errors
                        .push(format!("Job {} {}: {}", job.job_id(), terminal, reason));
                }
                pending => {
                    outcome
                        .errors
                        .push(format!("Job {} still {}", job.job_id(), pending));
                }
            }
        }

        Ok(outcome)
    }

    /// Ask the provider to cancel every job that has not finished.
    ///
    /// Returns how many cancellations were accepted.
    #[instrument(skip_all, fields(run_id = %state.run_id()))]
    pub async fn cancel_jobs(&self, state: &RunState) -> MythicResult<usize> {
        let mut cancelled = 0;
        for job in state.jobs().iter().filter(|j| !j.state().is_terminal()) {
            match self.client.cancel(job.job_id()).await {
                Ok(()) => {
                    info!(job_id = %job.job_id(), "Cancelled job");
                    cancelled += 1;
                }
                Err(e) => warn!(job_id = %job.job_id(), error = %e, "Failed to cancel job"),
            }
        }
        Ok(cancelled)
    }
}
