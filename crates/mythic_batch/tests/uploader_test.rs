//! Tests for reference staging.

mod test_utils;

use mythic_batch::{FilesCache, ReferenceUploader, UploadProgress};
use mythic_batch::codes::REFERENCE_UPLOAD_FAILED;
use mythic_interface::ReferenceStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_utils::{MockReferenceStore, generate_task, test_config, write_reference};

#[tokio::test]
async fn test_shared_reference_uploaded_once() {
    let dir = TempDir::new().unwrap();
    let refs = dir.path().join("refs");
    let a = write_reference(&refs, "a.png", b"reference a");
    let b = write_reference(&refs, "b.png", b"reference b");
    let tasks = vec![
        generate_task(dir.path(), "mira", "one", vec![a.clone()]),
        generate_task(dir.path(), "mira", "two", vec![a.clone()]),
        generate_task(dir.path(), "mira", "three", vec![b.clone()]),
    ];

    let store = Arc::new(MockReferenceStore::new());
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let mut snapshots: Vec<UploadProgress> = Vec::new();
    let outcome = uploader
        .upload(tasks, |p| snapshots.push(*p))
        .await
        .unwrap();

    assert_eq!(*outcome.stats.uploaded(), 2);
    assert_eq!(*outcome.stats.cached(), 1);
    assert_eq!(*outcome.stats.failed(), 0);
    assert_eq!(store.uploads().len(), 2);
    assert!(outcome.excluded.is_empty());

    // Every task carries the staged URI
    for task in &outcome.tasks {
        let reference = &task.reference_images()[0];
        assert_eq!(
            reference.uploaded_uri.as_deref(),
            Some(format!("mock://files/{}", reference.sha256).as_str())
        );
    }

    // Progress is monotonic and ends at the total
    assert!(!snapshots.is_empty());
    for pair in snapshots.windows(2) {
        assert!(pair[1].completed() >= pair[0].completed());
    }
    let last = snapshots.last().unwrap();
    assert_eq!(*last.total(), 3);
    assert_eq!(*last.completed(), 3);
    assert_eq!(*last.skipped(), 1);
}

#[tokio::test]
async fn test_files_cache_skips_second_batch() {
    let dir = TempDir::new().unwrap();
    let a = write_reference(&dir.path().join("refs"), "a.png", b"reference a");
    let store = Arc::new(MockReferenceStore::new());
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let first = vec![generate_task(dir.path(), "mira", "one", vec![a.clone()])];
    uploader.upload(first, |_| {}).await.unwrap();

    let second = vec![generate_task(dir.path(), "mira", "two", vec![a.clone()])];
    let outcome = uploader.upload(second, |_| {}).await.unwrap();

    assert_eq!(*outcome.stats.uploaded(), 0);
    assert_eq!(*outcome.stats.cached(), 1);
    assert_eq!(store.uploads().len(), 1);
    assert!(outcome.tasks[0].reference_images()[0].uploaded_uri.is_some());
}

#[tokio::test]
async fn test_expired_cache_entry_is_uploaded_again() {
    let dir = TempDir::new().unwrap();
    let a = write_reference(&dir.path().join("refs"), "a.png", b"reference a");
    let expired = chrono::Utc::now() - chrono::Duration::hours(1);
    let store = Arc::new(MockReferenceStore::new().with_expiry(expired));
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    uploader
        .upload(vec![generate_task(dir.path(), "mira", "one", vec![a.clone()])], |_| {})
        .await
        .unwrap();
    uploader
        .upload(vec![generate_task(dir.path(), "mira", "two", vec![a.clone()])], |_| {})
        .await
        .unwrap();

    assert_eq!(store.uploads().len(), 2);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let a = write_reference(&dir.path().join("refs"), "a.png", b"reference a");
    let store = Arc::new(MockReferenceStore::new().with_transient_failures(2));
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let outcome = uploader
        .upload(vec![generate_task(dir.path(), "mira", "one", vec![a.clone()])], |_| {})
        .await
        .unwrap();

    assert_eq!(*outcome.stats.uploaded(), 1);
    assert_eq!(store.attempts_for(&a.sha256), 3);
    assert!(outcome.errors.is_empty());
}

#[tokio::test]
async fn test_required_reference_failure_excludes_task() {
    let dir = TempDir::new().unwrap();
    let refs = dir.path().join("refs");
    let bad = write_reference(&refs, "bad.png", b"rejected bytes");
    let good = write_reference(&refs, "good.png", b"accepted bytes");

    let required = generate_task(dir.path(), "mira", "needs", vec![bad.clone().required()]);
    let optional = generate_task(dir.path(), "mira", "wants", vec![bad.clone(), good.clone()]);
    let required_key = required.key().clone();

    let store = Arc::new(MockReferenceStore::new().failing_for(&bad.sha256));
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let outcome = uploader.upload(vec![required, optional], |_| {}).await.unwrap();

    // Rejections are not retried
    assert_eq!(store.attempts_for(&bad.sha256), 1);
    assert_eq!(*outcome.stats.failed(), 2);
    assert_eq!(outcome.errors.len(), 1);

    assert_eq!(outcome.excluded.len(), 1);
    let reason = &outcome.excluded[&required_key];
    assert_eq!(reason.code, REFERENCE_UPLOAD_FAILED);
    assert!(reason.message.contains("bad.png"));

    // The optional task proceeds without the failed reference's URI
    let wants = &outcome.tasks[1];
    assert!(wants.reference_images()[0].uploaded_uri.is_none());
    assert!(wants.reference_images()[1].uploaded_uri.is_some());
}

#[tokio::test]
async fn test_missing_reference_file_fails_without_upload() {
    let dir = TempDir::new().unwrap();
    let mut missing = write_reference(&dir.path().join("refs"), "gone.png", b"soon gone");
    std::fs::remove_file(&missing.path).unwrap();
    missing = missing.required();

    let task = generate_task(dir.path(), "mira", "one", vec![missing.clone()]);
    let key = task.key().clone();
    let store = Arc::new(MockReferenceStore::new());
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let outcome = uploader.upload(vec![task], |_| {}).await.unwrap();
    assert_eq!(store.attempts_for(&missing.sha256), 0);
    assert!(outcome.excluded.contains_key(&key));
}

#[tokio::test]
async fn test_tasks_without_references() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockReferenceStore::new());
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let mut calls = 0;
    let outcome = uploader
        .upload(vec![generate_task(dir.path(), "mira", "one", Vec::new())], |_| calls += 1)
        .await
        .unwrap();

    assert_eq!(calls, 0);
    assert_eq!(outcome.tasks.len(), 1);
    assert_eq!(*outcome.stats.uploaded(), 0);
}

#[tokio::test]
async fn test_cleanup_deletes_staged_references() {
    let dir = TempDir::new().unwrap();
    let a = write_reference(&dir.path().join("refs"), "a.png", b"reference a");
    let store = Arc::new(MockReferenceStore::new());
    let config = test_config(dir.path());
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);
    let tasks = vec![generate_task(dir.path(), "mira", "one", vec![a.clone()])];

    uploader.upload(tasks.clone(), |_| {}).await.unwrap();
    let deleted = uploader.cleanup(&tasks).await.unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(store.deletes(), vec![format!("mock://files/{}", a.sha256)]);
    assert!(FilesCache::load(dir.path()).await.is_empty());
    assert_eq!(store.backend_name(), "mock");
}

#[tokio::test]
async fn test_uploads_respect_concurrency_limit() {
    let dir = TempDir::new().unwrap();
    let refs = dir.path().join("refs");
    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let reference = write_reference(
                &refs,
                &format!("{}.png", i),
                format!("reference {}", i).as_bytes(),
            );
            generate_task(dir.path(), "mira", &format!("pose-{}", i), vec![reference])
        })
        .collect();

    let store = Arc::new(MockReferenceStore::new().with_upload_delay(Duration::from_millis(20)));
    let config = test_config(dir.path()).with_upload_concurrency(2);
    let uploader = ReferenceUploader::new(store.clone(), dir.path(), &config);

    let outcome = uploader.upload(tasks, |_| {}).await.unwrap();

    assert_eq!(*outcome.stats.uploaded(), 6);
    assert_eq!(store.uploads().len(), 6);
    assert_eq!(store.peak_in_flight(), 2);
}
