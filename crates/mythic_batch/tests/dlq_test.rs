//! Tests for dead-letter persistence and retry planning.

mod test_utils;

use mythic_batch::{
    build_retry_plan, dlq_stats, format_dlq_for_console, load_dlq, permanent_failures,
    retryable_entries, write_dlq,
};
use mythic_core::{DlqEntry, Task, TaskError};
use tempfile::TempDir;
use test_utils::{generate_task, test_config};

fn entry(task: &Task, code: &str, retryable: bool, attempts: u32) -> DlqEntry {
    DlqEntry::new(
        task.clone(),
        &TaskError::new(code, format!("{} happened", code), retryable),
        attempts,
        Some("J1".to_string()),
        None,
    )
}

#[tokio::test]
async fn test_empty_dlq_writes_nothing() {
    let dir = TempDir::new().unwrap();
    assert!(write_dlq(dir.path(), &[]).await.unwrap().is_none());
    assert!(!dir.path().join("failed").exists());
    assert!(load_dlq(dir.path()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_later_writes_never_overwrite() {
    let dir = TempDir::new().unwrap();
    let a = generate_task(dir.path(), "mira", "a", Vec::new());
    let b = generate_task(dir.path(), "mira", "b", Vec::new());

    let first = write_dlq(dir.path(), &[entry(&a, "429", true, 1), entry(&b, "400", false, 1)])
        .await
        .unwrap()
        .unwrap();
    let second = write_dlq(dir.path(), &[entry(&a, "503", true, 2)])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first, dir.path().join("failed/dlq.json"));
    assert_eq!(second, dir.path().join("failed/dlq-2.json"));

    // Latest entry wins, first-seen order is kept
    let merged = load_dlq(dir.path()).await.unwrap();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].task_key(), a.key());
    assert_eq!(merged[0].error().code, "503");
    assert_eq!(merged[0].error().attempts, 2);
    assert_eq!(merged[1].task_key(), b.key());
}

#[tokio::test]
async fn test_retry_classification() {
    let dir = TempDir::new().unwrap();
    let tasks: Vec<Task> = ["a", "b", "c"]
        .iter()
        .map(|t| generate_task(dir.path(), "mira", t, Vec::new()))
        .collect();
    let entries = vec![
        entry(&tasks[0], "429", true, 1),
        entry(&tasks[1], "400", false, 1),
        entry(&tasks[2], "503", true, 3),
    ];

    let retryable: Vec<&str> = retryable_entries(&entries, 3).iter().map(|e| e.task_key()).collect();
    assert_eq!(retryable, vec![tasks[0].key().as_str()]);
    assert_eq!(permanent_failures(&entries, 3).len(), 2);

    let stats = dlq_stats(&entries, 3);
    assert_eq!(*stats.total(), 3);
    assert_eq!(*stats.retryable(), 1);
    assert_eq!(*stats.permanent(), 2);
    assert_eq!(stats.by_code()["429"], 1);

    let text = format_dlq_for_console(&entries, 3);
    assert!(text.contains("Dead letter queue: 3 failed tasks"));
    assert!(text.contains("Retryable: 1"));
    assert!(text.contains("400: 400 happened"));
    assert_eq!(format_dlq_for_console(&[], 3), "Dead letter queue is empty.");
}

#[tokio::test]
async fn test_retry_plan_carries_attempts() {
    let dir = TempDir::new().unwrap();
    let a = generate_task(dir.path(), "mira", "a", Vec::new());
    let b = generate_task(dir.path(), "ansel", "b", Vec::new());
    let c = generate_task(dir.path(), "ansel", "c", Vec::new());
    let entries = vec![
        entry(&a, "429", true, 2),
        entry(&b, "400", false, 1),
        entry(&c, "NO_RESULT", true, 1),
    ];
    let config = test_config(dir.path());

    let plan = build_retry_plan(&entries, "retry-1", &config, 5);
    assert_eq!(plan.run_id(), "retry-1");
    assert_eq!(plan.tasks().len(), 2);
    assert_eq!(plan.tasks()[0].key(), a.key());
    assert_eq!(plan.attempts_for(a.key()), 2);
    assert_eq!(plan.attempts_for(c.key()), 1);
    assert_eq!(plan.attempts_for(b.key()), 0);
    assert_eq!(
        plan.scope().entity_filter,
        Some(vec!["ansel".to_string(), "mira".to_string()])
    );

    let nothing = build_retry_plan(&entries, "retry-2", &config, 1);
    assert!(nothing.tasks().is_empty());
}
