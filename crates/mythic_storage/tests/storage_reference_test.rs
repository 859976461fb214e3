//! Tests for the content-addressed reference store.

use mythic_error::{MythicErrorKind, StorageErrorKind};
use mythic_interface::ReferenceStore;
use mythic_storage::{FileSystemReferenceStore, compute_hash};
use tempfile::TempDir;

#[tokio::test]
async fn test_upload_stages_by_hash() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemReferenceStore::new(temp_dir.path()).unwrap();

    let data = b"portrait bytes";
    let hash = compute_hash(data);
    let reference = store.upload(data, &hash, "image/png").await.unwrap();

    assert!(reference.uri().starts_with("file://"));
    assert!(reference.uri().ends_with(&format!("{}.png", hash)));
    assert_eq!(*reference.size_bytes(), data.len() as u64);
    assert!(reference.expires_at().is_none());

    let staged = temp_dir
        .path()
        .join(&hash[0..2])
        .join(&hash[2..4])
        .join(format!("{}.png", hash));
    assert_eq!(std::fs::read(staged).unwrap(), data);
}

#[tokio::test]
async fn test_upload_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemReferenceStore::new(temp_dir.path()).unwrap();

    let data = b"same bytes";
    let hash = compute_hash(data);
    let first = store.upload(data, &hash, "image/jpeg").await.unwrap();
    let second = store.upload(data, &hash, "image/jpeg").await.unwrap();

    assert_eq!(first.uri(), second.uri());
    assert!(first.uri().ends_with(".jpg"));
}

#[tokio::test]
async fn test_hash_mismatch_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemReferenceStore::new(temp_dir.path()).unwrap();

    let wrong = compute_hash(b"something else");
    let err = store.upload(b"actual", &wrong, "image/png").await.unwrap_err();

    assert!(matches!(
        err.kind(),
        MythicErrorKind::Storage(e) if matches!(e.kind, StorageErrorKind::HashMismatch(_))
    ));
}

#[tokio::test]
async fn test_delete_staged_reference() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemReferenceStore::new(temp_dir.path()).unwrap();

    let data = b"to be removed";
    let hash = compute_hash(data);
    let reference = store.upload(data, &hash, "image/png").await.unwrap();
    let path = reference.uri().trim_start_matches("file://").to_string();
    assert!(std::path::Path::new(&path).exists());

    store.delete(reference.uri()).await.unwrap();
    assert!(!std::path::Path::new(&path).exists());

    // Deleting twice is fine
    store.delete(reference.uri()).await.unwrap();

    let err = store.delete("file:///etc/passwd").await.unwrap_err();
    assert!(matches!(
        err.kind(),
        MythicErrorKind::Storage(e) if matches!(e.kind, StorageErrorKind::InvalidPath(_))
    ));
}

#[test]
fn test_backend_name() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileSystemReferenceStore::new(temp_dir.path()).unwrap();
    assert_eq!(store.backend_name(), "filesystem");
}
