//! Collaborator traits.

use crate::{EntityDocument, JobHandle, JobStatus, RemoteReference, SubmitRequest};
use async_trait::async_trait;
use mythic_core::EntityType;
use mythic_error::MythicResult;
use std::path::{Path, PathBuf};

/// Asynchronous batch provider.
///
/// Implementations must round-trip each task key verbatim as the `custom_id`
/// of its result line.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submit one partition of tasks as a job.
    async fn submit(&self, request: &SubmitRequest<'_>) -> MythicResult<JobHandle>;

    /// Query a job's current state.
    async fn poll(&self, job_id: &str) -> MythicResult<JobStatus>;

    /// Write the job's result JSONL to `dest`.
    ///
    /// The file must appear atomically: either the whole file or nothing.
    async fn download_results(&self, job_id: &str, dest: &Path) -> MythicResult<PathBuf>;

    /// Ask the provider to stop a job.
    async fn cancel(&self, job_id: &str) -> MythicResult<()>;

    /// Provider name (e.g., "gemini", "spool").
    fn provider_name(&self) -> &'static str;
}

/// Store that makes reference images addressable by the provider.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Stage bytes under their content hash. Idempotent by hash.
    async fn upload(
        &self,
        data: &[u8],
        content_hash: &str,
        mime: &str,
    ) -> MythicResult<RemoteReference>;

    /// Forget a staged reference. Deleting an unknown URI is not an error.
    async fn delete(&self, uri: &str) -> MythicResult<()>;

    /// Backend name (e.g., "filesystem", "gemini-files").
    fn backend_name(&self) -> &'static str;
}

/// Per-entity YAML metadata documents.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Read a document, or `None` if it does not exist.
    async fn read(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
    ) -> MythicResult<Option<serde_yaml::Value>>;

    /// Replace a document.
    async fn write(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
        doc: &serde_yaml::Value,
    ) -> MythicResult<()>;

    /// Copy a document to its `.bak` sibling.
    ///
    /// Returns the backup path, or `None` if there was nothing to copy.
    async fn backup(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
    ) -> MythicResult<Option<PathBuf>>;

    /// Directory that owns an entity's files. Inventory paths are relative to it.
    fn entity_dir(&self, entity_type: EntityType, slug: &str) -> PathBuf;
}
