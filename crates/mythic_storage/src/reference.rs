//! Content-addressed staging area for reference images.
//!
//! This backend stages reference bytes in a content-addressable filesystem
//! structure, so the same image attached to many tasks is stored once.

use crate::{compute_hash, write_atomic};
use async_trait::async_trait;
use mythic_error::{MythicResult, StorageError, StorageErrorKind};
use mythic_interface::{ReferenceStore, RemoteReference};
use std::path::PathBuf;

/// Filesystem reference store.
///
/// Stores references in a content-addressable structure:
/// `{base_path}/{hash[0:2]}/{hash[2:4]}/{hash}.{ext}`
///
/// # Example Structure
///
/// ```text
/// .mythic/staged/
/// ├── ab/
/// │   └── cd/
/// │       └── abcdef123456....png
/// └── 12/
///     └── 34/
///         └── 123456abcdef....jpg
/// ```
///
/// Returned URIs use the `file://` scheme and never expire.
#[derive(Debug, Clone)]
pub struct FileSystemReferenceStore {
    base_path: PathBuf,
}

impl FileSystemReferenceStore {
    /// Create a new reference store.
    ///
    /// Creates the base directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or accessed.
    #[tracing::instrument(skip(base_path))]
    pub fn new(base_path: impl Into<PathBuf>) -> MythicResult<Self> {
        let base_path = base_path.into();

        std::fs::create_dir_all(&base_path).map_err(|e| {
            StorageError::new(StorageErrorKind::DirectoryCreation(format!(
                "{}: {}",
                base_path.display(),
                e
            )))
        })?;

        tracing::info!(path = %base_path.display(), "Created reference store");
        Ok(Self { base_path })
    }

    /// Root directory of the staging area.
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    /// Get the filesystem path for a given hash and MIME type.
    fn get_path(&self, hash: &str, mime: &str) -> MythicResult<PathBuf> {
        if hash.len() < 4 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::new(StorageErrorKind::InvalidPath(format!(
                "not a content hash: {}",
                hash
            )))
            .into());
        }

        Ok(self
            .base_path
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{}.{}", hash, extension_for_mime(mime))))
    }

    /// Verify content hash matches expected hash.
    fn verify_hash(data: &[u8], expected_hash: &str) -> MythicResult<()> {
        let actual_hash = compute_hash(data);
        if actual_hash != expected_hash {
            return Err(StorageError::new(StorageErrorKind::HashMismatch(format!(
                "expected {}, got {}",
                expected_hash, actual_hash
            )))
            .into());
        }
        Ok(())
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

#[async_trait]
impl ReferenceStore for FileSystemReferenceStore {
    #[tracing::instrument(skip(self, data), fields(size = data.len(), hash = %content_hash))]
    async fn upload(
        &self,
        data: &[u8],
        content_hash: &str,
        mime: &str,
    ) -> MythicResult<RemoteReference> {
        Self::verify_hash(data, content_hash)?;
        let path = self.get_path(content_hash, mime)?;
        let uri = format!("file://{}", path.display());

        // If file already exists, just return reference (deduplication)
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(
                hash = %content_hash,
                path = %path.display(),
                "Reference already staged, returning existing reference"
            );
            return Ok(RemoteReference::new(uri, data.len() as u64, None));
        }

        write_atomic(&path, data).await?;

        tracing::info!(
            hash = %content_hash,
            path = %path.display(),
            size = data.len(),
            "Staged reference image"
        );

        Ok(RemoteReference::new(uri, data.len() as u64, None))
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, uri: &str) -> MythicResult<()> {
        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        if !path.starts_with(&self.base_path) {
            return Err(StorageError::new(StorageErrorKind::InvalidPath(format!(
                "{} is outside {}",
                path.display(),
                self.base_path.display()
            )))
            .into());
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Deleted staged reference");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::new(StorageErrorKind::FileWrite(format!(
                "delete {}: {}",
                path.display(),
                e
            )))
            .into()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
