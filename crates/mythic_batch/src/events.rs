//! Progress events emitted while a pipeline runs.

use crate::{JobProgress, UploadProgress};
use mythic_core::RunPhase;

/// Something a caller may want to display.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// The run entered a new phase. Emitted after the state was persisted.
    PhaseChanged {
        /// Run identifier
        run_id: String,
        /// Previous phase
        from: RunPhase,
        /// New phase
        to: RunPhase,
    },
    /// A reference finished staging
    UploadProgress(UploadProgress),
    /// A poll tick finished
    JobProgress(JobProgress),
    /// The run reached a terminal phase
    Finished {
        /// Run identifier
        run_id: String,
        /// Terminal phase
        phase: RunPhase,
    },
}

/// Receives pipeline events.
///
/// Observers are called inline on the pipeline task, so they should return
/// quickly.
pub trait PipelineObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &PipelineEvent);
}

impl<F> PipelineObserver for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) {
        self(event)
    }
}
