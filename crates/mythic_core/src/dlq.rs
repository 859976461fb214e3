//! Dead-letter queue entries.

use crate::{Task, TaskError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure details recorded with a dead-lettered task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqError {
    /// Error code
    pub code: String,
    /// Error message
    pub message: String,
    /// Whether resubmitting could succeed
    #[serde(default)]
    pub retryable: bool,
    /// When the entry was created
    pub timestamp: DateTime<Utc>,
    /// Attempts made so far, including this one
    pub attempts: u32,
    /// When the last attempt failed
    pub last_attempt_at: DateTime<Utc>,
}

/// A task that could not be completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct DlqEntry {
    /// The failed task
    task: Task,
    /// Failure details
    error: DlqError,
    /// Job the task belonged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    /// Raw provider line, for diagnosis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_response: Option<String>,
}

impl DlqEntry {
    /// Dead-letter a task.
    pub fn new(
        task: Task,
        error: &TaskError,
        attempts: u32,
        job_id: Option<String>,
        raw_response: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task,
            error: DlqError {
                code: error.code.clone(),
                message: error.message.clone(),
                retryable: error.retryable,
                timestamp: now,
                attempts,
                last_attempt_at: now,
            },
            job_id,
            raw_response,
        }
    }

    /// Key of the dead-lettered task.
    pub fn task_key(&self) -> &str {
        self.task.key()
    }
}
