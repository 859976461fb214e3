//! The orchestrator: drives one plan through every phase under the run lock.

use crate::{
    JobExecutor, JobSubmitter, LockInfo, LockOutcome, PipelineEvent, PipelineObserver,
    ReferenceUploader, ResultApplier, RunCounters, RunReport, RunStateStore, acquire_lock,
    generate_report, save_report, write_dlq,
};
use mythic_core::{BatchConfig, Plan, RunPhase, RunState, Task, TaskError, TaskResult};
use mythic_error::{BatchError, BatchErrorKind, MythicResult};
use mythic_interface::{BatchClient, EntityStore, ReferenceStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// How a call to [`BatchPipeline::execute`] ended.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Another run holds the artifact directory. Nothing was written.
    Locked(LockInfo),
    /// Every phase finished. Individual tasks may still have failed.
    Completed(RunReport),
    /// A phase failed and the run was marked failed.
    Failed {
        /// Report of the failed run
        report: RunReport,
        /// What stopped the run
        error: String,
    },
}

/// Drives a plan from `planned` to `completed` or `failed`.
///
/// Every collaborator is injected. State is persisted after each phase
/// transition, so a run interrupted at any point can be executed again with
/// the same run id and continues where it stopped.
pub struct BatchPipeline {
    store: RunStateStore,
    uploader: ReferenceUploader,
    submitter: JobSubmitter,
    executor: JobExecutor,
    applier: ResultApplier,
    cleanup_after_success: bool,
    observer: Option<Arc<dyn PipelineObserver>>,
}

impl BatchPipeline {
    /// Assemble a pipeline from its stages.
    pub fn new(
        store: RunStateStore,
        uploader: ReferenceUploader,
        submitter: JobSubmitter,
        executor: JobExecutor,
        applier: ResultApplier,
    ) -> Self {
        Self {
            store,
            uploader,
            submitter,
            executor,
            applier,
            cleanup_after_success: false,
            observer: None,
        }
    }

    /// Wire every stage from a config and the three collaborators.
    pub fn from_config(
        config: &BatchConfig,
        client: Arc<dyn BatchClient>,
        references: Arc<dyn ReferenceStore>,
        entities: Arc<dyn EntityStore>,
    ) -> Self {
        let store = RunStateStore::new(config.artifact_dir().clone());
        Self::new(
            store.clone(),
            ReferenceUploader::new(references, config.artifact_dir().clone(), config),
            JobSubmitter::new(Arc::clone(&client), store.clone(), config),
            JobExecutor::new(client, store, config.poll_interval()),
            ResultApplier::new(entities, *config.create_backups()),
        )
        .with_cleanup(*config.cleanup_after_success())
    }

    /// Send events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Delete staged references after a completed run.
    pub fn with_cleanup(mut self, cleanup_after_success: bool) -> Self {
        self.cleanup_after_success = cleanup_after_success;
        self
    }

    /// The run state store this pipeline persists into.
    pub fn store(&self) -> &RunStateStore {
        &self.store
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    /// Execute (or resume) `plan`.
    ///
    /// The artifact lock is taken first. If another run holds it, the holder
    /// is returned as [`PipelineOutcome::Locked`] and nothing else happens.
    /// The lock is released on every exit path; if this future is dropped
    /// mid-run, the lock guard's `Drop` removes it. Lock file I/O runs on the
    /// blocking thread pool.
    ///
    /// # Errors
    ///
    /// Phase failures are not errors: they end in [`PipelineOutcome::Failed`].
    /// Errors are returned only when the lock or run state cannot be read or
    /// written, or when `plan` names a run that already finished
    /// (`RunAlreadyFinished`).
    #[instrument(skip_all, fields(run_id = %plan.run_id(), tasks = plan.tasks().len()))]
    pub async fn execute(&self, plan: &Plan) -> MythicResult<PipelineOutcome> {
        let artifact_dir = self.store.artifact_dir().to_path_buf();
        let run_id = plan.run_id().clone();
        let acquired = tokio::task::spawn_blocking(move || acquire_lock(&artifact_dir, &run_id))
            .await
            .map_err(|e| BatchError::new(BatchErrorKind::LockTask(e.to_string())))??;
        let lock = match acquired {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::Held(holder) => {
                warn!(holder = %holder.run_id(), pid = holder.pid(), "Artifact directory is locked by another run");
                return Ok(PipelineOutcome::Locked(holder));
            }
        };

        let outcome = self.run_locked(plan).await;

        let released = tokio::task::spawn_blocking(move || {
            let mut lock = lock;
            lock.release()
        })
        .await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to release run lock"),
            Err(e) => warn!(error = %e, "Lock release task did not complete"),
        }
        outcome
    }

    async fn run_locked(&self, plan: &Plan) -> MythicResult<PipelineOutcome> {
        let run_id = plan.run_id();
        let mut state = match self.store.load_state(run_id).await? {
            Some(state) if state.phase().is_terminal() => {
                return Err(BatchError::new(BatchErrorKind::RunAlreadyFinished(run_id.clone())).into());
            }
            Some(state) => {
                info!(phase = %state.phase(), jobs = state.jobs().len(), "Resuming run");
                if self.store.load_plan(run_id).await?.is_none() {
                    self.store.save_plan(plan).await?;
                }
                state
            }
            None => {
                self.store.save_plan(plan).await?;
                let state = RunState::new(run_id.clone(), plan.scope().clone(), plan.config().clone());
                self.store.save_state(&state).await?;
                info!("Created run");
                state
            }
        };

        let mut counters = RunCounters::default();
        match self.drive(plan, &mut state, &mut counters).await {
            Ok(results) => {
                let report = generate_report(plan, &state, &results).with_counters(counters);
                save_report(&self.store.run_dir(run_id), &report).await?;
                self.emit(PipelineEvent::Finished {
                    run_id: run_id.clone(),
                    phase: *state.phase(),
                });
                info!(
                    succeeded = report.success_count(),
                    failed = report.fail_count(),
                    "Run completed"
                );
                Ok(PipelineOutcome::Completed(report))
            }
            Err(e) => {
                let message = e.to_string();
                error!(phase = %state.phase(), error = %message, "Run failed");
                let from = *state.phase();
                state.mark_failed(message.clone());
                self.store.save_state(&state).await?;
                self.emit(PipelineEvent::PhaseChanged {
                    run_id: run_id.clone(),
                    from,
                    to: RunPhase::Failed,
                });

                let report = generate_report(plan, &state, &[]).with_counters(counters);
                save_report(&self.store.run_dir(run_id), &report).await?;
                self.emit(PipelineEvent::Finished {
                    run_id: run_id.clone(),
                    phase: RunPhase::Failed,
                });
                Ok(PipelineOutcome::Failed {
                    report,
                    error: message,
                })
            }
        }
    }

    async fn transition(&self, state: &mut RunState, next: RunPhase) -> MythicResult<()> {
        let from = *state.phase();
        state.advance(next)?;
        self.store.save_state(state).await?;
        self.emit(PipelineEvent::PhaseChanged {
            run_id: state.run_id().clone(),
            from,
            to: next,
        });
        Ok(())
    }

    /// Run the remaining phases, starting from whatever phase `state` is in.
    async fn drive(
        &self,
        plan: &Plan,
        state: &mut RunState,
        counters: &mut RunCounters,
    ) -> MythicResult<Vec<TaskResult>> {
        let mut excluded: BTreeMap<String, TaskError> = BTreeMap::new();

        if *state.phase() < RunPhase::Running {
            if *state.phase() == RunPhase::Planned {
                self.transition(state, RunPhase::Staging).await?;
            }

            let staged = self
                .uploader
                .upload(plan.tasks().clone(), |progress| {
                    self.emit(PipelineEvent::UploadProgress(*progress))
                })
                .await?;
            for message in &staged.errors {
                warn!(error = %message, "Reference staging error");
            }
            counters.record_staging(staged.stats);
            excluded = staged.excluded;
            if *state.phase() == RunPhase::Staging {
                self.transition(state, RunPhase::Staged).await?;
            }

            let submitted = self
                .submitter
                .submit(state, &staged.tasks, &excluded)
                .await?;
            debug!(
                submitted = submitted.submitted(),
                reused = submitted.reused(),
                empty = submitted.empty(),
                "Submission pass finished"
            );
            if state.jobs().is_empty() {
                return Err(BatchError::new(BatchErrorKind::NoJobsSubmitted(
                    state.run_id().clone(),
                ))
                .into());
            }
            self.transition(state, RunPhase::Running).await?;
        }

        if *state.phase() == RunPhase::Running {
            self.executor
                .poll_until_terminal(state, |progress| {
                    self.emit(PipelineEvent::JobProgress(progress.clone()))
                })
                .await?;
            self.transition(state, RunPhase::Downloading).await?;
        }

        // Downloading and a resumed Applying both need the files; existing
        // ones are reused, not fetched again.
        let downloaded = self.executor.download_results(state).await?;
        for message in &downloaded.errors {
            warn!(error = %message, "Job produced no result file");
        }
        if downloaded.files.is_empty() {
            return Err(
                BatchError::new(BatchErrorKind::NoResultFiles(state.run_id().clone())).into(),
            );
        }
        if *state.phase() == RunPhase::Downloading {
            self.transition(state, RunPhase::Applying).await?;
        }

        let applied = self
            .applier
            .apply(plan, state, &downloaded.files, &excluded)
            .await?;
        for message in &applied.errors {
            warn!(error = %message, "Result apply error");
        }
        counters.record_apply(applied.counts());
        write_dlq(&self.store.run_dir(state.run_id()), &applied.dlq).await?;
        self.transition(state, RunPhase::Completed).await?;

        if self.cleanup_after_success {
            self.cleanup(plan.tasks()).await;
        }
        Ok(applied.results)
    }

    async fn cleanup(&self, tasks: &[Task]) {
        if let Err(e) = self.uploader.cleanup(tasks).await {
            warn!(error = %e, "Reference cleanup failed");
        }
    }
}
