//! Tests for run state persistence.

mod test_utils;

use mythic_batch::RunStateStore;
use mythic_core::{BatchConfig, JobInfo, JobState, RunPhase, RunState, Scope};
use tempfile::TempDir;
use test_utils::{generate_task, plan, test_config};

fn state(run_id: &str) -> RunState {
    RunState::new(run_id, Scope::default(), BatchConfig::default())
}

#[tokio::test]
async fn test_state_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = RunStateStore::new(dir.path());

    let mut run = state("2025-01-01T00-00-00-000");
    run.advance(RunPhase::Staging).unwrap();
    run.add_job(JobInfo::new("J1", 0, vec!["k1".to_string(), "k2".to_string()]));
    run.set_job_state("J1", JobState::Running, None);
    store.save_state(&run).await.unwrap();

    let loaded = store
        .load_state("2025-01-01T00-00-00-000")
        .await
        .unwrap()
        .expect("state saved");
    assert_eq!(loaded, run);
    assert_eq!(*loaded.jobs()[0].state(), JobState::Running);
    assert!(dir.path().join("2025-01-01T00-00-00-000/state.json").exists());
}

#[tokio::test]
async fn test_missing_state_is_none() {
    let dir = TempDir::new().unwrap();
    let store = RunStateStore::new(dir.path());
    assert!(store.load_state("nope").await.unwrap().is_none());
    assert!(store.load_plan("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_plan_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = RunStateStore::new(dir.path());
    let config = test_config(dir.path());
    let task = generate_task(dir.path(), "mira", "portrait", Vec::new());
    let original = plan("run-1", &config, vec![task]);

    store.save_plan(&original).await.unwrap();
    let loaded = store.load_plan("run-1").await.unwrap().unwrap();
    assert_eq!(loaded.tasks(), original.tasks());
    assert_eq!(loaded.run_id(), "run-1");
}

#[tokio::test]
async fn test_list_runs_newest_first_and_skips_corrupt() {
    let dir = TempDir::new().unwrap();
    let store = RunStateStore::new(dir.path());

    for run_id in ["2025-01-01T00-00-00-000", "2025-03-01T00-00-00-000", "2025-02-01T00-00-00-000"] {
        store.save_state(&state(run_id)).await.unwrap();
    }
    let corrupt = dir.path().join("2025-04-01T00-00-00-000");
    std::fs::create_dir_all(&corrupt).unwrap();
    std::fs::write(corrupt.join("state.json"), "{ truncated").unwrap();
    std::fs::create_dir_all(dir.path().join("empty-dir")).unwrap();

    let ids: Vec<String> = store
        .list_runs()
        .await
        .unwrap()
        .iter()
        .map(|r| r.run_id().clone())
        .collect();
    assert_eq!(
        ids,
        vec![
            "2025-03-01T00-00-00-000",
            "2025-02-01T00-00-00-000",
            "2025-01-01T00-00-00-000",
        ]
    );
}

#[tokio::test]
async fn test_most_recent_resumable_skips_finished() {
    let dir = TempDir::new().unwrap();
    let store = RunStateStore::new(dir.path());

    let older = state("2025-01-01T00-00-00-000");
    store.save_state(&older).await.unwrap();

    let mut newer = state("2025-02-01T00-00-00-000");
    newer.mark_failed("boom");
    store.save_state(&newer).await.unwrap();

    let resumable = store.most_recent_resumable().await.unwrap().unwrap();
    assert_eq!(resumable.run_id(), "2025-01-01T00-00-00-000");
}

#[tokio::test]
async fn test_list_runs_without_artifact_dir() {
    let dir = TempDir::new().unwrap();
    let store = RunStateStore::new(dir.path().join("missing"));
    assert!(store.list_runs().await.unwrap().is_empty());
}
