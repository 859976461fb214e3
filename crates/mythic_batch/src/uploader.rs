//! Reference image staging.
//!
//! References are deduplicated by content hash before anything is uploaded:
//! each distinct hash is staged at most once per batch, and the files cache
//! carries uploads over between runs.

use crate::FilesCache;
use crate::codes::REFERENCE_UPLOAD_FAILED;
use crate::files_cache::FilesCacheEntry;
use futures::stream::{self, StreamExt};
use mythic_core::{BatchConfig, ReferenceImage, Task, TaskError};
use mythic_error::{
    MythicError, MythicErrorKind, MythicResult, RetryableError, StorageError, StorageErrorKind,
};
use mythic_interface::{ReferenceStore, RemoteReference};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry2::{Retry, RetryError, strategy::ExponentialBackoff, strategy::jitter};
use tracing::{debug, info, instrument, warn};

/// Retries per reference after the first attempt.
const UPLOAD_RETRIES: usize = 3;

/// Running totals reported after every staged reference.
///
/// Totals count reference occurrences across tasks, so a hash shared by three
/// tasks contributes three to `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_getters::Getters)]
pub struct UploadProgress {
    /// Occurrences staged, fresh or cached
    completed: usize,
    /// Occurrences served from cache
    skipped: usize,
    /// Occurrences that could not be staged
    failed: usize,
    /// All occurrences
    total: usize,
}

/// Aggregate staging statistics.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
    derive_getters::Getters,
)]
pub struct UploadStats {
    /// Fresh uploads
    uploaded: usize,
    /// Occurrences served by the files cache or an earlier upload in this batch
    cached: usize,
    /// Occurrences that failed
    failed: usize,
    /// Bytes sent in fresh uploads
    total_bytes: u64,
}

/// Result of staging a batch.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Tasks with `uploaded_uri` filled in where staging succeeded
    pub tasks: Vec<Task>,
    /// Aggregate statistics
    pub stats: UploadStats,
    /// Tasks that must not be submitted, with the reason
    pub excluded: BTreeMap<String, TaskError>,
    /// Per-reference error messages
    pub errors: Vec<String>,
}

enum Staged {
    Uploaded(RemoteReference),
    Failed(String),
}

/// Stages every task's reference images through a [`ReferenceStore`].
pub struct ReferenceUploader {
    store: Arc<dyn ReferenceStore>,
    artifact_dir: PathBuf,
    concurrency: usize,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl ReferenceUploader {
    /// Create an uploader. The files cache lives in `artifact_dir`.
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        artifact_dir: impl Into<PathBuf>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            store,
            artifact_dir: artifact_dir.into(),
            concurrency: (*config.upload_concurrency()).max(1),
            base_delay_ms: *config.upload_base_delay_ms(),
            max_delay_ms: *config.upload_max_delay_ms(),
        }
    }

    /// Stage all references of `tasks` with at most `upload_concurrency`
    /// uploads in flight.
    ///
    /// A failed reference never aborts the batch. Tasks that marked it
    /// `required` land in [`UploadOutcome::excluded`]; other tasks proceed
    /// without it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the files cache cannot be saved.
    #[instrument(skip_all, fields(tasks = tasks.len(), store = self.store.backend_name()))]
    pub async fn upload<F>(
        &self,
        tasks: Vec<Task>,
        mut on_progress: F,
    ) -> MythicResult<UploadOutcome>
    where
        F: FnMut(&UploadProgress) + Send,
    {
        let mut cache = FilesCache::load(&self.artifact_dir).await;
        let expired = cache.clean_expired();
        if expired > 0 {
            debug!(expired, "Dropped expired files cache entries");
        }

        // Distinct references in first-seen order, with occurrence counts
        let mut order: Vec<ReferenceImage> = Vec::new();
        let mut occurrences: HashMap<String, usize> = HashMap::new();
        for reference in tasks.iter().flat_map(|t| t.reference_images()) {
            let count = occurrences.entry(reference.sha256.clone()).or_insert(0);
            if *count == 0 {
                order.push(reference.clone());
            }
            *count += 1;
        }

        let mut progress = UploadProgress {
            total: occurrences.values().sum(),
            ..UploadProgress::default()
        };
        let mut stats = UploadStats::default();
        let mut uris: HashMap<String, String> = HashMap::new();
        let mut failed_hashes: HashMap<String, String> = HashMap::new();
        let mut errors = Vec::new();

        let mut pending = Vec::new();
        for reference in order {
            match cache.get_valid(&reference.sha256) {
                Some(entry) => {
                    let count = occurrences[&reference.sha256];
                    uris.insert(reference.sha256.clone(), entry.uri().clone());
                    stats.cached += count;
                    progress.completed += count;
                    progress.skipped += count;
                    on_progress(&progress);
                }
                None => pending.push(reference),
            }
        }

        let mut staged = stream::iter(pending)
            .map(|reference| async move {
                let result = match self.upload_one(&reference).await {
                    Ok(remote) => Staged::Uploaded(remote),
                    Err(e) => Staged::Failed(e.to_string()),
                };
                (reference, result)
            })
            .buffer_unordered(self.concurrency);

        while let Some((reference, result)) = staged.next().await {
            let count = occurrences[&reference.sha256];
            match result {
                Staged::Uploaded(remote) => {
                    stats.uploaded += 1;
                    stats.cached += count - 1;
                    stats.total_bytes += *remote.size_bytes();
                    progress.completed += count;
                    progress.skipped += count - 1;
                    cache.insert(FilesCacheEntry::new(
                        reference.path.clone(),
                        remote.uri().clone(),
                        reference.sha256.clone(),
                        reference.mime.clone(),
                        *remote.expires_at(),
                    ));
                    uris.insert(reference.sha256.clone(), remote.uri().clone());
                }
                Staged::Failed(message) => {
                    warn!(path = %reference.path.display(), error = %message, "Failed to stage reference");
                    stats.failed += count;
                    progress.failed += count;
                    errors.push(format!(
                        "Failed to upload {}: {}",
                        reference.path.display(),
                        message
                    ));
                    failed_hashes.insert(reference.sha256.clone(), message);
                }
            }
            on_progress(&progress);
        }
        drop(staged);

        cache.save(&self.artifact_dir).await?;

        let mut excluded = BTreeMap::new();
        let tasks = tasks
            .into_iter()
            .map(|task| {
                let references: Vec<ReferenceImage> = task
                    .reference_images()
                    .iter()
                    .cloned()
                    .map(|mut r| {
                        r.uploaded_uri = uris.get(&r.sha256).cloned();
                        r
                    })
                    .collect();

                if let Some(missing) = references
                    .iter()
                    .find(|r| r.required && failed_hashes.contains_key(&r.sha256))
                {
                    excluded.insert(
                        task.key().clone(),
                        TaskError::new(
                            REFERENCE_UPLOAD_FAILED,
                            format!(
                                "Required reference {} could not be staged: {}",
                                missing.path.display(),
                                failed_hashes[&missing.sha256]
                            ),
                            true,
                        ),
                    );
                }
                task.with_reference_images(references)
            })
            .collect();

        info!(
            uploaded = stats.uploaded,
            cached = stats.cached,
            failed = stats.failed,
            total_bytes = stats.total_bytes,
            excluded = excluded.len(),
            "Staged references"
        );

        Ok(UploadOutcome {
            tasks,
            stats,
            excluded,
            errors,
        })
    }

    /// Read and stage one reference, retrying transient failures with backoff.
    async fn upload_one(&self, reference: &ReferenceImage) -> MythicResult<RemoteReference> {
        let data = tokio::fs::read(&reference.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::new(StorageErrorKind::NotFound(reference.path.display().to_string()))
            } else {
                StorageError::new(StorageErrorKind::FileRead(format!(
                    "{}: {}",
                    reference.path.display(),
                    e
                )))
            }
        })?;

        let retry_strategy = ExponentialBackoff::from_millis(self.base_delay_ms)
            .factor(2)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .map(jitter)
            .take(UPLOAD_RETRIES);

        let data = &data;
        let store = &self.store;
        Retry::spawn(retry_strategy, || async move {
            match store.upload(data, &reference.sha256, &reference.mime).await {
                Ok(remote) => Ok(remote),
                Err(e) if is_transient(&e) => {
                    warn!(path = %reference.path.display(), error = %e, "Transient upload error, will retry");
                    Err(RetryError::Transient {
                        err: e,
                        retry_after: None,
                    })
                }
                Err(e) => Err(RetryError::Permanent(e)),
            }
        })
        .await
    }

    /// Forget the staged copies of every reference `tasks` use.
    ///
    /// Failures are logged and skipped. Returns how many were deleted.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn cleanup(&self, tasks: &[Task]) -> MythicResult<usize> {
        let hashes: HashSet<&str> = tasks
            .iter()
            .flat_map(|t| t.reference_images())
            .map(|r| r.sha256.as_str())
            .collect();

        let mut cache = FilesCache::load(&self.artifact_dir).await;
        let mut deleted = 0;
        for hash in hashes {
            let Some(entry) = cache.remove(hash) else {
                continue;
            };
            match self.store.delete(entry.uri()).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(uri = %entry.uri(), error = %e, "Failed to delete staged reference"),
            }
        }
        cache.save(&self.artifact_dir).await?;

        info!(deleted, "Cleaned up staged references");
        Ok(deleted)
    }
}

/// Whether a staging failure is worth retrying.
fn is_transient(err: &MythicError) -> bool {
    match err.kind() {
        MythicErrorKind::Provider(e) => e.is_retryable(),
        _ => false,
    }
}
