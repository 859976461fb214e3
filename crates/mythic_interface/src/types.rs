//! Value types exchanged with collaborators.

use chrono::{DateTime, Utc};
use mythic_core::{JobState, Task};
use serde::{Deserialize, Serialize};

/// One partition of tasks to submit as a job.
#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    /// Run the job belongs to
    pub run_id: &'a str,
    /// Partition index within the run
    pub chunk_index: usize,
    /// Model to run the job with
    pub model: &'a str,
    /// Tasks in the partition
    pub tasks: &'a [Task],
}

/// Handle returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Provider job id
    pub job_id: String,
}

/// Polled job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Current state
    pub state: JobState,
    /// Provider error message for failed jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    /// A status without an error message.
    pub fn new(state: JobState) -> Self {
        Self { state, error: None }
    }

    /// A failed status with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            error: Some(message.into()),
        }
    }
}

/// A staged reference image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct RemoteReference {
    /// URI the provider resolves
    uri: String,
    /// Size of the staged bytes
    size_bytes: u64,
    /// When the provider forgets the upload, if ever
    expires_at: Option<DateTime<Utc>>,
}

impl RemoteReference {
    /// Create a reference.
    pub fn new(uri: impl Into<String>, size_bytes: u64, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            uri: uri.into(),
            size_bytes,
            expires_at,
        }
    }
}

/// Which YAML document of an entity to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityDocument {
    /// `imagery.yaml`: prompts, appearance, image inventories
    Imagery,
    /// `imagery.runs.yaml`: flat log of generation runs
    Runs,
}

impl EntityDocument {
    /// File name inside the entity directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            EntityDocument::Imagery => "imagery.yaml",
            EntityDocument::Runs => "imagery.runs.yaml",
        }
    }
}
