//! Atomic file writes and JSON helpers.

use mythic_error::{JsonError, MythicResult, StorageError, StorageErrorKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Write bytes to `path` via a temp sibling and a rename.
///
/// Readers see either the previous contents or the new contents, never a
/// partial file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> MythicResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            StorageError::new(StorageErrorKind::DirectoryCreation(format!(
                "{}: {}",
                parent.display(),
                e
            )))
        })?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = Path::new(&temp_name);

    tokio::fs::write(temp_path, data).await.map_err(|e| {
        StorageError::new(StorageErrorKind::FileWrite(format!(
            "{}: {}",
            temp_path.display(),
            e
        )))
    })?;

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        StorageError::new(StorageErrorKind::FileWrite(format!(
            "rename {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        )))
    })?;

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> MythicResult<()> {
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| JsonError::in_document(path, format!("Failed to serialize: {}", e)))?;
    write_atomic(path, contents.as_bytes()).await
}

/// Read and parse a JSON file. Returns `None` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> MythicResult<Option<T>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                path.display(),
                e
            )))
            .into());
        }
    };

    let value = serde_json::from_str(&contents)
        .map_err(|e| JsonError::in_document(path, format!("Failed to parse: {}", e)))?;
    Ok(Some(value))
}
