//! Tests for applying result files.

mod test_utils;

use mythic_batch::ResultApplier;
use mythic_batch::codes::{
    ANALYSIS_FAILED, APPLY_FAILED, NO_IMAGE_DATA, NO_RESULT, NOT_SUBMITTED,
    REFERENCE_UPLOAD_FAILED, UNEXPECTED_PAYLOAD,
};
use mythic_core::{
    EntityType, JobInfo, JobState, Plan, RunState, Task, TaskError, TaskKind, TaskStatus,
};
use mythic_interface::{EntityDocument, EntityStore};
use mythic_storage::FileSystemEntityStore;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use test_utils::{
    IMAGE_BYTES, analysis_yaml, analyze_task, analyze_task_with, error_line, generate_task,
    image_line, plan, status_error_line, test_config, text_line,
};

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    entities: Arc<FileSystemEntityStore>,
    applier: ResultApplier,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("content");
        let entities = Arc::new(FileSystemEntityStore::new(&root));
        let applier = ResultApplier::new(entities.clone(), true);
        Self {
            _dir: dir,
            root,
            entities,
            applier,
        }
    }

    fn plan(&self, tasks: Vec<Task>) -> Plan {
        plan("run-1", &test_config(&self.root.join(".batch")), tasks)
    }

    /// A state with every given task in job J1.
    fn state(&self, plan: &Plan, submitted: &[&Task]) -> RunState {
        let mut state = RunState::new("run-1", plan.scope().clone(), plan.config().clone());
        let keys = submitted.iter().map(|t| t.key().clone()).collect();
        state.add_job(JobInfo::new("J1", 0, keys));
        state.set_job_state("J1", JobState::Succeeded, None);
        state
    }

    fn results(&self, lines: &[String]) -> PathBuf {
        let path = self.root.join(".batch/run-1/results.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }
}

fn error_code<'a>(outcome: &'a mythic_batch::ApplyOutcome, key: &str) -> &'a TaskError {
    outcome
        .results
        .iter()
        .find(|r| r.task_key() == key)
        .and_then(|r| r.error().as_ref())
        .unwrap_or_else(|| panic!("no failure recorded for {}", key))
}

fn inventory_len(doc: &serde_yaml::Value) -> usize {
    doc["image_inventory"].as_sequence().map_or(0, |s| s.len())
}

async fn imagery(entities: &FileSystemEntityStore, slug: &str) -> serde_yaml::Value {
    entities
        .read(EntityType::Character, slug, EntityDocument::Imagery)
        .await
        .unwrap()
        .expect("imagery document written")
}

#[tokio::test]
async fn test_generated_images_and_appearance_are_merged() {
    let fx = Fixture::new();
    let tasks = vec![
        generate_task(&fx.root, "mira", "one", Vec::new()),
        generate_task(&fx.root, "mira", "two", Vec::new()),
        generate_task(&fx.root, "ansel", "one", Vec::new()),
        analyze_task(&fx.root, "mira", "appearance"),
    ];
    let plan = fx.plan(tasks.clone());
    let state = fx.state(&plan, &tasks.iter().collect::<Vec<_>>());
    let file = fx.results(&[
        image_line(tasks[0].key()),
        image_line(tasks[1].key()),
        image_line(tasks[2].key()),
        text_line(tasks[3].key(), "  Tall, with a weathered face.\n"),
    ]);

    let outcome = fx
        .applier
        .apply(&plan, &state, &[file], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(
        (outcome.images_written, outcome.yaml_updated, outcome.failed),
        (3, 1, 0)
    );
    assert_eq!(outcome.inventory_updated, 3);
    assert!(outcome.dlq.is_empty());
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.results.len(), 4);

    let image = fx.root.join("characters/mira/images/mira-one.png");
    assert_eq!(std::fs::read(&image).unwrap(), IMAGE_BYTES);

    let mira = imagery(&fx.entities, "mira").await;
    assert_eq!(inventory_len(&mira), 2);
    assert_eq!(mira["appearance"].as_str(), Some("Tall, with a weathered face."));
    assert_eq!(mira["image_inventory"][0]["path"].as_str(), Some("images/mira-one.png"));
    assert_eq!(mira["image_inventory"][0]["type"].as_str(), Some("generated"));

    let runs = fx
        .entities
        .read(EntityType::Character, "mira", EntityDocument::Runs)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runs["runs"].as_sequence().unwrap().len(), 2);
}

#[tokio::test]
async fn test_reapplying_is_idempotent() {
    let fx = Fixture::new();
    let task = generate_task(&fx.root, "mira", "one", Vec::new());
    let plan = fx.plan(vec![task.clone()]);
    let state = fx.state(&plan, &[&task]);
    let file = fx.results(&[image_line(task.key())]);

    for _ in 0..2 {
        fx.applier
            .apply(&plan, &state, &[file.clone()], &BTreeMap::new())
            .await
            .unwrap();
    }

    let mira = imagery(&fx.entities, "mira").await;
    assert_eq!(inventory_len(&mira), 1);
    // Backups were taken before the second write
    assert!(fx.root.join("characters/mira/imagery.yaml.bak").exists());
}

#[tokio::test]
async fn test_provider_errors_keep_retry_class() {
    let fx = Fixture::new();
    let tasks: Vec<Task> = ["a", "b", "c"]
        .iter()
        .map(|t| generate_task(&fx.root, "mira", t, Vec::new()))
        .collect();
    let plan = fx.plan(tasks.clone());
    let state = fx.state(&plan, &tasks.iter().collect::<Vec<_>>());
    let file = fx.results(&[
        error_line(tasks[0].key(), 429, "rate limited"),
        error_line(tasks[1].key(), 503, "overloaded"),
        error_line(tasks[2].key(), 400, "bad prompt"),
    ]);

    let outcome = fx
        .applier
        .apply(&plan, &state, &[file], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(outcome.failed, 3);
    assert!(error_code(&outcome, tasks[0].key()).retryable);
    assert!(error_code(&outcome, tasks[1].key()).retryable);
    let bad = error_code(&outcome, tasks[2].key());
    assert!(!bad.retryable);
    assert_eq!(bad.code, "400");
    assert_eq!(bad.message, "bad prompt");

    let dlq = &outcome.dlq[0];
    assert_eq!(dlq.job_id().as_deref(), Some("J1"));
    assert_eq!(dlq.error().attempts, 1);
    assert!(dlq.raw_response().as_deref().unwrap().contains("rate limited"));
}

#[tokio::test]
async fn test_symbolic_status_decides_retry_class() {
    let fx = Fixture::new();
    let tasks: Vec<Task> = ["a", "b"]
        .iter()
        .map(|t| generate_task(&fx.root, "mira", t, Vec::new()))
        .collect();
    let plan = fx.plan(tasks.clone());
    let state = fx.state(&plan, &tasks.iter().collect::<Vec<_>>());
    let file = fx.results(&[
        status_error_line(tasks[0].key(), 8, "RESOURCE_EXHAUSTED", "quota exceeded"),
        status_error_line(tasks[1].key(), 3, "INVALID_ARGUMENT", "bad prompt"),
    ]);

    let outcome = fx
        .applier
        .apply(&plan, &state, &[file], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(outcome.failed, 2);
    let exhausted = error_code(&outcome, tasks[0].key());
    assert!(exhausted.retryable);
    assert_eq!(exhausted.code, "8");
    assert!(!error_code(&outcome, tasks[1].key()).retryable);

    let dlq = outcome
        .dlq
        .iter()
        .find(|entry| entry.task_key() == tasks[0].key())
        .expect("exhausted task in DLQ");
    assert!(dlq.error().retryable);
}

#[tokio::test]
async fn test_stray_lines_do_not_stop_the_stream() {
    let fx = Fixture::new();
    let task = generate_task(&fx.root, "mira", "one", Vec::new());
    let plan = fx.plan(vec![task.clone()]);
    let state = fx.state(&plan, &[&task]);
    let file = fx.results(&[
        "{ not json".to_string(),
        image_line("character/nobody/portrait@deadbeef"),
        String::new(),
        image_line(task.key()),
        error_line(task.key(), 500, "late duplicate"),
    ]);

    let outcome = fx
        .applier
        .apply(&plan, &state, &[file], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome.errors.iter().any(|e| e.contains("Unknown task key")));
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(*outcome.results[0].status(), TaskStatus::Success);
    assert_eq!(outcome.failed, 0);
}

#[tokio::test]
async fn test_payload_mismatches_fail_permanently() {
    let fx = Fixture::new();
    let generate = generate_task(&fx.root, "mira", "one", Vec::new());
    let analyze = analyze_task(&fx.root, "mira", "appearance");
    let plan = fx.plan(vec![generate.clone(), analyze.clone()]);
    let state = fx.state(&plan, &[&generate, &analyze]);
    let file = fx.results(&[
        text_line(generate.key(), "I cannot draw that"),
        image_line(analyze.key()),
    ]);

    let outcome = fx
        .applier
        .apply(&plan, &state, &[file], &BTreeMap::new())
        .await
        .unwrap();

    let no_image = error_code(&outcome, generate.key());
    assert_eq!(no_image.code, NO_IMAGE_DATA);
    assert!(!no_image.retryable);
    assert_eq!(error_code(&outcome, analyze.key()).code, UNEXPECTED_PAYLOAD);
    assert!(!fx.root.join("characters/mira/imagery.yaml").exists());
}

#[tokio::test]
async fn test_image_analysis_updates_matching_entry() {
    let fx = Fixture::new();
    let generate = generate_task(&fx.root, "mira", "one", Vec::new());
    let plan = fx.plan(vec![generate.clone()]);
    let file = fx.results(&[image_line(generate.key())]);
    fx.applier
        .apply(&plan, &fx.state(&plan, &[&generate]), &[file], &BTreeMap::new())
        .await
        .unwrap();

    let analyze = analyze_task_with(&fx.root, "mira", "image_analysis", Some("mira-one.png"));
    let plan = fx.plan(vec![analyze.clone()]);
    let file = fx.results(&[text_line(
        analyze.key(),
        &format!("```yaml\n{}```", analysis_yaml("portrait-1", "images/mira-one.png")),
    )]);
    let outcome = fx
        .applier
        .apply(&plan, &fx.state(&plan, &[&analyze]), &[file], &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(outcome.yaml_updated, 1);
    let mira = imagery(&fx.entities, "mira").await;
    assert_eq!(inventory_len(&mira), 1);
    let entry = &mira["image_inventory"][0];
    assert_eq!(entry["id"].as_str(), Some("mira-one"));
    assert_eq!(entry["type"].as_str(), Some("imported"));
    assert_eq!(entry["content"]["title"].as_str(), Some("Portrait"));
}

#[tokio::test]
async fn test_invalid_analysis_leaves_document_alone() {
    let fx = Fixture::new();
    let appearance = analyze_task(&fx.root, "mira", "appearance");
    let plan = fx.plan(vec![appearance.clone()]);
    let file = fx.results(&[text_line(appearance.key(), "Short and cheerful.")]);
    fx.applier
        .apply(&plan, &fx.state(&plan, &[&appearance]), &[file], &BTreeMap::new())
        .await
        .unwrap();
    let before = imagery(&fx.entities, "mira").await;

    let analyze = analyze_task_with(&fx.root, "mira", "image_analysis", Some("x.png"));
    let plan = fx.plan(vec![analyze.clone()]);
    let file = fx.results(&[text_line(analyze.key(), "id: only-an-id\npath: images/x.png\n")]);
    let outcome = fx
        .applier
        .apply(&plan, &fx.state(&plan, &[&analyze]), &[file], &BTreeMap::new())
        .await
        .unwrap();

    let failure = error_code(&outcome, analyze.key());
    assert_eq!(failure.code, ANALYSIS_FAILED);
    assert!(!failure.retryable);
    assert_eq!(imagery(&fx.entities, "mira").await, before);
}

#[tokio::test]
async fn test_location_without_document_fails_apply() {
    let fx = Fixture::new();
    let task = Task::builder()
        .kind(TaskKind::Generate)
        .entity_type(EntityType::Location)
        .entity_slug("inn")
        .target_id("overview")
        .prompt("An inn")
        .output_dir(fx.root.join("locations/inn/images"))
        .output_file_name("inn-overview")
        .model("test-model")
        .build()
        .unwrap();
    let plan = fx.plan(vec![task.clone()]);
    let file = fx.results(&[image_line(task.key())]);

    let outcome = fx
        .applier
        .apply(&plan, &fx.state(&plan, &[&task]), &[file], &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(error_code(&outcome, task.key()).code, APPLY_FAILED);
}

#[tokio::test]
async fn test_location_overview_is_merged() {
    let fx = Fixture::new();
    let dir = fx.root.join("locations/inn");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("imagery.yaml"),
        "overview:\n  slug: overview\nzones:\n  - slug: taproom\n",
    )
    .unwrap();
    let task = Task::builder()
        .kind(TaskKind::Generate)
        .entity_type(EntityType::Location)
        .entity_slug("inn")
        .target_id("taproom")
        .prompt("The taproom")
        .output_dir(dir.join("images"))
        .output_file_name("inn-taproom")
        .model("test-model")
        .build()
        .unwrap();
    let plan = fx.plan(vec![task.clone()]);
    let file = fx.results(&[image_line(task.key())]);

    let outcome = fx
        .applier
        .apply(&plan, &fx.state(&plan, &[&task]), &[file], &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(outcome.failed, 0);

    let doc = fx
        .entities
        .read(EntityType::Location, "inn", EntityDocument::Imagery)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        doc["zones"][0]["image_inventory"][0]["path"].as_str(),
        Some("images/inn-taproom.png")
    );
    // Locations keep no separate run log
    assert!(!dir.join("imagery.runs.yaml").exists());
}

#[tokio::test]
async fn test_unseen_tasks_are_accounted_for() {
    let fx = Fixture::new();
    let tasks: Vec<Task> = ["returned", "missing", "excluded", "unsubmitted"]
        .iter()
        .map(|t| generate_task(&fx.root, "mira", t, Vec::new()))
        .collect();
    let plan = fx
        .plan(tasks.clone())
        .with_prior_attempts(HashMap::from([(tasks[1].key().clone(), 2)]));
    let mut state = fx.state(&plan, &[&tasks[0], &tasks[1]]);
    state.set_job_state("J1", JobState::Succeeded, Some("partial output".to_string()));
    let file = fx.results(&[image_line(tasks[0].key())]);

    let mut excluded = BTreeMap::new();
    excluded.insert(
        tasks[2].key().clone(),
        TaskError::new(REFERENCE_UPLOAD_FAILED, "reference gone", true),
    );

    let outcome = fx
        .applier
        .apply(&plan, &state, &[file], &excluded)
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 4);
    assert_eq!(outcome.failed, 3);

    let missing = error_code(&outcome, tasks[1].key());
    assert_eq!(missing.code, NO_RESULT);
    assert!(missing.retryable);
    assert!(missing.message.contains("partial output"));
    assert_eq!(error_code(&outcome, tasks[2].key()).code, REFERENCE_UPLOAD_FAILED);
    assert_eq!(error_code(&outcome, tasks[3].key()).code, NOT_SUBMITTED);

    let attempts: HashMap<&str, u32> = outcome
        .dlq
        .iter()
        .map(|e| (e.task_key(), e.error().attempts))
        .collect();
    assert_eq!(attempts[tasks[1].key().as_str()], 3);
    assert_eq!(attempts[tasks[3].key().as_str()], 1);
}
