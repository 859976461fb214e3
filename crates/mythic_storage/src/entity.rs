//! YAML entity metadata store.

use crate::write_atomic;
use async_trait::async_trait;
use mythic_core::EntityType;
use mythic_error::{MythicResult, StorageError, StorageErrorKind, YamlError};
use mythic_interface::{EntityDocument, EntityStore};
use std::path::{Path, PathBuf};

/// Entity store backed by a content tree on disk.
///
/// Documents live at `{content_root}/{characters|locations|chapters}/{slug}/{file}`.
#[derive(Debug, Clone)]
pub struct FileSystemEntityStore {
    content_root: PathBuf,
}

impl FileSystemEntityStore {
    /// Create a store rooted at `content_root`.
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
        }
    }

    /// Root of the content tree.
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    /// Full path of a document.
    pub fn document_path(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
    ) -> PathBuf {
        self.entity_dir(entity_type, slug).join(document.file_name())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

#[async_trait]
impl EntityStore for FileSystemEntityStore {
    #[tracing::instrument(skip(self), fields(entity_type = %entity_type, slug))]
    async fn read(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
    ) -> MythicResult<Option<serde_yaml::Value>> {
        let path = self.document_path(entity_type, slug, document);

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Entity document not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(StorageError::new(StorageErrorKind::FileRead(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
                .into());
            }
        };

        let doc = serde_yaml::from_str(&contents)
            .map_err(|e| YamlError::new(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(Some(doc))
    }

    #[tracing::instrument(skip(self, doc), fields(entity_type = %entity_type, slug))]
    async fn write(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
        doc: &serde_yaml::Value,
    ) -> MythicResult<()> {
        let path = self.document_path(entity_type, slug, document);
        let contents = serde_yaml::to_string(doc).map_err(|e| {
            YamlError::new(format!("Failed to serialize {}: {}", path.display(), e))
        })?;

        write_atomic(&path, contents.as_bytes()).await?;
        tracing::debug!(path = %path.display(), "Wrote entity document");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(entity_type = %entity_type, slug))]
    async fn backup(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
    ) -> MythicResult<Option<PathBuf>> {
        let path = self.document_path(entity_type, slug, document);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let backup = backup_path(&path);
        tokio::fs::copy(&path, &backup).await.map_err(|e| {
            StorageError::new(StorageErrorKind::Backup(format!(
                "{} to {}: {}",
                path.display(),
                backup.display(),
                e
            )))
        })?;

        tracing::debug!(backup = %backup.display(), "Backed up entity document");
        Ok(Some(backup))
    }

    fn entity_dir(&self, entity_type: EntityType, slug: &str) -> PathBuf {
        self.content_root.join(entity_type.dir_name()).join(slug)
    }
}
