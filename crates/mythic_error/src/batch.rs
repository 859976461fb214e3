//! Pipeline orchestration error types.

/// Specific error conditions raised while driving a batch run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum BatchErrorKind {
    /// A phase change that the run state machine does not allow
    #[display("Invalid phase transition from {} to {}", from, to)]
    InvalidTransition {
        /// Phase the run is currently in
        from: String,
        /// Phase that was requested
        to: String,
    },
    /// No persisted state exists for the run
    #[display("Run not found: {}", _0)]
    RunNotFound(String),
    /// The run already reached a terminal phase
    #[display("Run {} already finished", _0)]
    RunAlreadyFinished(String),
    /// A task key that does not follow `{entity}/{slug}/{target}@{hash}`
    #[display("Invalid task key: {}", _0)]
    InvalidTaskKey(String),
    /// Submitting a job to the provider failed
    #[display("Submission failed: {}", _0)]
    SubmissionFailed(String),
    /// Every chunk was empty or excluded, so nothing reached the provider
    #[display("No jobs were submitted for run {}", _0)]
    NoJobsSubmitted(String),
    /// Every job finished without producing a result file
    #[display("No result files were downloaded for run {}", _0)]
    NoResultFiles(String),
    /// A result file could not be streamed
    #[display("Failed to read results: {}", _0)]
    ResultStream(String),
    /// An inventory entry failed schema validation
    #[display("Validation failed: {}", _0)]
    Validation(String),
    /// The entity document lacks the target a result should be merged into
    #[display("Target not found: {}", _0)]
    TargetNotFound(String),
    /// The lock is held by a different run
    #[display("Lock held by run {}", _0)]
    LockHeld(String),
    /// The blocking lock operation panicked or was cancelled
    #[display("Lock operation did not complete: {}", _0)]
    LockTask(String),
}

/// Error type for batch pipeline operations.
///
/// # Examples
///
/// ```
/// use mythic_error::{BatchError, BatchErrorKind};
///
/// let err = BatchError::new(BatchErrorKind::RunNotFound("2025-01-01T00-00-00-000".into()));
/// assert!(format!("{}", err).contains("Run not found"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Batch Error: {} at line {} in {}", kind, line, file)]
pub struct BatchError {
    /// The specific error condition
    pub kind: BatchErrorKind,
    /// Line number where the error occurred
    pub line: u32,
    /// Source file where the error occurred
    pub file: &'static str,
}

impl BatchError {
    /// Create a new BatchError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: BatchErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }
}
