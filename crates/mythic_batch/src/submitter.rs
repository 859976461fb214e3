//! Job submission.

use crate::RunStateStore;
use mythic_core::{BatchConfig, JobInfo, RunState, Task};
use mythic_error::{BatchError, BatchErrorKind, MythicResult};
use mythic_interface::{BatchClient, SubmitRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What a submission pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_getters::Getters)]
pub struct SubmitOutcome {
    /// Jobs created by this pass
    submitted: usize,
    /// Chunks skipped because a job was already recorded for them
    reused: usize,
    /// Chunks skipped because every task in them was excluded
    empty: usize,
}

/// Partitions tasks into provider jobs and records each handle as soon as
/// the provider returns it.
pub struct JobSubmitter {
    client: Arc<dyn BatchClient>,
    store: RunStateStore,
    max_tasks_per_job: usize,
    model: String,
}

impl JobSubmitter {
    /// Create a submitter.
    pub fn new(client: Arc<dyn BatchClient>, store: RunStateStore, config: &BatchConfig) -> Self {
        Self {
            client,
            store,
            max_tasks_per_job: (*config.max_tasks_per_job()).max(1),
            model: config.model().clone(),
        }
    }

    /// Submit every chunk of `tasks` that has no recorded job.
    ///
    /// Chunks are cut in plan order, so chunk indices are stable across
    /// resumes. Excluded tasks are dropped from their chunk, and chunks left
    /// empty are not submitted. After each successful submission the job is
    /// appended to `state` and the state is persisted before the next chunk
    /// is touched.
    ///
    /// # Errors
    ///
    /// Any submission failure is returned as `SubmissionFailed`. Jobs submitted
    /// before the failure stay recorded.
    #[instrument(skip_all, fields(run_id = %state.run_id(), tasks = tasks.len(), provider = self.client.provider_name()))]
    pub async fn submit<E>(
        &self,
        state: &mut RunState,
        tasks: &[Task],
        excluded: &BTreeMap<String, E>,
    ) -> MythicResult<SubmitOutcome> {
        let mut outcome = SubmitOutcome::default();

        for (chunk_index, chunk) in tasks.chunks(self.max_tasks_per_job).enumerate() {
            if state.has_chunk(chunk_index) {
                debug!(chunk_index, "Chunk already submitted, reusing recorded job");
                outcome.reused += 1;
                continue;
            }

            let batch: Vec<Task> = chunk
                .iter()
                .filter(|t| !excluded.contains_key(t.key()))
                .cloned()
                .collect();
            if batch.is_empty() {
                debug!(chunk_index, "Every task in chunk excluded, skipping");
                outcome.empty += 1;
                continue;
            }

            let request = SubmitRequest {
                run_id: state.run_id(),
                chunk_index,
                model: &self.model,
                tasks: &batch,
            };
            let handle = self.client.submit(&request).await.map_err(|e| {
                BatchError::new(BatchErrorKind::SubmissionFailed(format!(
                    "chunk {}: {}",
                    chunk_index, e
                )))
            })?;

            let keys = batch.iter().map(|t| t.key().clone()).collect();
            state.add_job(JobInfo::new(handle.job_id.clone(), chunk_index, keys));
            self.store.save_state(state).await?;

            info!(job_id = %handle.job_id, chunk_index, task_count = batch.len(), "Submitted job");
            outcome.submitted += 1;
        }

        Ok(outcome)
    }
}
