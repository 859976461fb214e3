//! Per-task outcomes produced by the applier.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::PathBuf;

/// Outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Output written
    #[display("success")]
    Success,
    /// Task failed
    #[display("failed")]
    Failed,
    /// Task intentionally not processed
    #[display("skipped")]
    Skipped,
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[display("{}: {}", code, message)]
pub struct TaskError {
    /// Provider status code or a symbolic code such as `NO_IMAGE_DATA`
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Whether resubmitting could succeed
    pub retryable: bool,
}

impl TaskError {
    /// Create a task error.
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

/// Result of one task after apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct TaskResult {
    /// Key of the task
    task_key: String,
    /// Outcome
    status: TaskStatus,
    /// Written file, for image tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_path: Option<PathBuf>,
    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
    /// Provider response metadata (finish reason, token usage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_metadata: Option<JsonValue>,
}

impl TaskResult {
    /// A successful result.
    pub fn success(
        task_key: impl Into<String>,
        output_path: Option<PathBuf>,
        provider_metadata: Option<JsonValue>,
    ) -> Self {
        Self {
            task_key: task_key.into(),
            status: TaskStatus::Success,
            output_path,
            error: None,
            provider_metadata,
        }
    }

    /// A failed result.
    pub fn failed(task_key: impl Into<String>, error: TaskError) -> Self {
        Self {
            task_key: task_key.into(),
            status: TaskStatus::Failed,
            output_path: None,
            error: Some(error),
            provider_metadata: None,
        }
    }

    /// A skipped result.
    pub fn skipped(task_key: impl Into<String>) -> Self {
        Self {
            task_key: task_key.into(),
            status: TaskStatus::Skipped,
            output_path: None,
            error: None,
            provider_metadata: None,
        }
    }

    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}
