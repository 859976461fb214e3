//! Content hashing.

use mythic_error::{MythicResult, StorageError, StorageErrorKind};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Compute the hex SHA-256 of data.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Read a file and return its bytes along with their hash.
pub async fn hash_file(path: &Path) -> MythicResult<(Vec<u8>, String)> {
    let data = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::new(StorageErrorKind::NotFound(path.display().to_string()))
        } else {
            StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                path.display(),
                e
            )))
        }
    })?;
    let hash = compute_hash(&data);
    Ok((data, hash))
}
