//! Directory-backed batch client.
//!
//! Each submitted job becomes a directory under the spool root. A worker (or
//! an operator, or a test) completes a job by dropping marker files into it:
//!
//! | File            | Job state   |
//! |-----------------|-------------|
//! | `cancelled`     | CANCELLED   |
//! | `error.txt`     | FAILED      |
//! | `results.jsonl` | SUCCEEDED   |
//! | `started`       | RUNNING     |
//! | none of these   | PENDING     |

use crate::write_atomic;
use async_trait::async_trait;
use chrono::Utc;
use mythic_core::JobState;
use mythic_error::{
    JsonError, MythicError, MythicResult, ProviderError, ProviderErrorKind, StorageError,
    StorageErrorKind,
};
use mythic_interface::{BatchClient, JobHandle, JobStatus, SubmitRequest};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const REQUESTS_FILE: &str = "requests.jsonl";
const JOB_FILE: &str = "job.json";
const RESULTS_FILE: &str = "results.jsonl";
const ERROR_FILE: &str = "error.txt";
const CANCELLED_MARKER: &str = "cancelled";
const STARTED_MARKER: &str = "started";

/// Batch client that spools jobs to a local directory.
#[derive(Debug, Clone)]
pub struct FileSpoolBatchClient {
    spool_dir: PathBuf,
}

impl FileSpoolBatchClient {
    /// Create a client spooling into `spool_dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    #[tracing::instrument(skip(spool_dir))]
    pub fn new(spool_dir: impl Into<PathBuf>) -> MythicResult<Self> {
        let spool_dir = spool_dir.into();
        std::fs::create_dir_all(&spool_dir).map_err(|e| {
            StorageError::new(StorageErrorKind::DirectoryCreation(format!(
                "{}: {}",
                spool_dir.display(),
                e
            )))
        })?;
        tracing::info!(path = %spool_dir.display(), "Created spool batch client");
        Ok(Self { spool_dir })
    }

    /// Directory of one job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.spool_dir.join(job_id)
    }

    async fn existing_job_dir(&self, job_id: &str) -> MythicResult<PathBuf> {
        let dir = self.job_dir(job_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ProviderError::new(ProviderErrorKind::UnknownJob(job_id.to_string())).into());
        }
        Ok(dir)
    }

    /// Mark a job as picked up by a worker.
    pub async fn mark_started(&self, job_id: &str) -> MythicResult<()> {
        let dir = self.existing_job_dir(job_id).await?;
        write_atomic(&dir.join(STARTED_MARKER), b"").await
    }

    /// Complete a job with the given result JSONL.
    pub async fn complete_job(&self, job_id: &str, results_jsonl: &str) -> MythicResult<()> {
        let dir = self.existing_job_dir(job_id).await?;
        write_atomic(&dir.join(RESULTS_FILE), results_jsonl.as_bytes()).await
    }

    /// Fail a job with a message.
    pub async fn fail_job(&self, job_id: &str, message: &str) -> MythicResult<()> {
        let dir = self.existing_job_dir(job_id).await?;
        write_atomic(&dir.join(ERROR_FILE), message.as_bytes()).await
    }

    /// The request lines a job was submitted with.
    pub async fn read_requests(&self, job_id: &str) -> MythicResult<Vec<serde_json::Value>> {
        let path = self.existing_job_dir(job_id).await?.join(REQUESTS_FILE);
        let contents = read_to_string(&path).await?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    MythicError::from(JsonError::in_document(
                        &path,
                        format!("Failed to parse request: {}", e),
                    ))
                })
            })
            .collect()
    }

    /// Ids of every job in the spool, sorted.
    pub async fn list_jobs(&self) -> MythicResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.spool_dir).await.map_err(|e| {
            StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                self.spool_dir.display(),
                e
            )))
        })?;

        let mut jobs = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                jobs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        jobs.sort();
        Ok(jobs)
    }
}

async fn read_to_string(path: &Path) -> MythicResult<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        MythicError::from(StorageError::new(StorageErrorKind::FileRead(format!(
            "{}: {}",
            path.display(),
            e
        ))))
    })
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl BatchClient for FileSpoolBatchClient {
    #[tracing::instrument(skip(self, request), fields(run_id = %request.run_id, chunk = request.chunk_index, tasks = request.tasks.len()))]
    async fn submit(&self, request: &SubmitRequest<'_>) -> MythicResult<JobHandle> {
        if request.tasks.is_empty() {
            return Err(ProviderError::new(ProviderErrorKind::Rejected(
                "batch contains no requests".to_string(),
            ))
            .into());
        }

        let job_id = format!(
            "{}-{:03}-{}",
            request.run_id,
            request.chunk_index,
            Uuid::new_v4().simple()
        );
        let dir = self.job_dir(&job_id);

        let mut lines = String::new();
        for task in request.tasks {
            let line = json!({ "custom_id": task.key(), "task": task });
            let encoded = serde_json::to_string(&line)
                .map_err(|e| JsonError::new(format!("Failed to encode request: {}", e)))?;
            lines.push_str(&encoded);
            lines.push('\n');
        }

        let job = json!({
            "job_id": job_id,
            "run_id": request.run_id,
            "chunk_index": request.chunk_index,
            "model": request.model,
            "task_count": request.tasks.len(),
            "submitted_at": Utc::now(),
        });
        let job = serde_json::to_vec_pretty(&job)
            .map_err(|e| JsonError::new(format!("Failed to encode job: {}", e)))?;

        // Requests first: a job directory with job.json is always complete.
        write_atomic(&dir.join(REQUESTS_FILE), lines.as_bytes()).await?;
        write_atomic(&dir.join(JOB_FILE), &job).await?;

        tracing::info!(job_id = %job_id, "Spooled batch job");
        Ok(JobHandle { job_id })
    }

    #[tracing::instrument(skip(self))]
    async fn poll(&self, job_id: &str) -> MythicResult<JobStatus> {
        let dir = self.existing_job_dir(job_id).await?;

        let status = if exists(&dir.join(CANCELLED_MARKER)).await {
            JobStatus::new(JobState::Cancelled)
        } else if exists(&dir.join(ERROR_FILE)).await {
            let message = read_to_string(&dir.join(ERROR_FILE)).await?;
            JobStatus::failed(message.trim())
        } else if exists(&dir.join(RESULTS_FILE)).await {
            JobStatus::new(JobState::Succeeded)
        } else if exists(&dir.join(STARTED_MARKER)).await {
            JobStatus::new(JobState::Running)
        } else {
            JobStatus::new(JobState::Pending)
        };

        tracing::debug!(state = %status.state, "Polled spooled job");
        Ok(status)
    }

    #[tracing::instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn download_results(&self, job_id: &str, dest: &Path) -> MythicResult<PathBuf> {
        let source = self.existing_job_dir(job_id).await?.join(RESULTS_FILE);
        if !exists(&source).await {
            return Err(ProviderError::new(ProviderErrorKind::InvalidResponse(format!(
                "job {} has no results",
                job_id
            )))
            .into());
        }

        let data = tokio::fs::read(&source).await.map_err(|e| {
            StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                source.display(),
                e
            )))
        })?;
        write_atomic(dest, &data).await?;

        tracing::info!(job_id, size = data.len(), "Downloaded job results");
        Ok(dest.to_path_buf())
    }

    #[tracing::instrument(skip(self))]
    async fn cancel(&self, job_id: &str) -> MythicResult<()> {
        let dir = self.existing_job_dir(job_id).await?;
        if exists(&dir.join(RESULTS_FILE)).await || exists(&dir.join(ERROR_FILE)).await {
            tracing::debug!("Job already finished, nothing to cancel");
            return Ok(());
        }
        write_atomic(&dir.join(CANCELLED_MARKER), b"").await?;
        tracing::info!("Cancelled spooled job");
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "spool"
    }
}
