//! Applies decoded results: image files on disk, entries in entity documents.

use crate::codes::{
    ANALYSIS_FAILED, APPLY_FAILED, EMPTY_RESPONSE, NO_IMAGE_DATA, NO_RESULT, NOT_SUBMITTED,
    UNEXPECTED_PAYLOAD,
};
use crate::decoder::{DecodedResult, ReadLine, ResultKind, ResultReader, is_retryable_code};
use crate::inventory::{
    InventoryEntry, RunRecord, build_generated_entry, new_character_document, set_appearance,
    upsert_character_entry, upsert_chapter_entry, upsert_location_entry, upsert_run_record,
};
use mythic_core::{DlqEntry, EntityType, Plan, RunState, Task, TaskError, TaskKind, TaskResult};
use mythic_error::{BatchError, BatchErrorKind, MythicResult};
use mythic_interface::{EntityDocument, EntityStore};
use mythic_storage::write_atomic;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Everything the apply phase produced.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// One result per plan task
    pub results: Vec<TaskResult>,
    /// Dead-letter entries for every failed task
    pub dlq: Vec<DlqEntry>,
    /// Image files written
    pub images_written: usize,
    /// Analysis payloads merged into entity documents
    pub yaml_updated: usize,
    /// Generated-image entries merged into inventories
    pub inventory_updated: usize,
    /// Failed tasks
    pub failed: usize,
    /// Orchestration errors that belong to no task (unknown keys, malformed lines)
    pub errors: Vec<String>,
}

/// What an apply pass changed, without the per-task detail.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
    derive_getters::Getters,
)]
pub struct ApplyCounts {
    /// Image files written
    images_written: usize,
    /// Analysis payloads merged into entity documents
    yaml_updated: usize,
    /// Generated-image entries merged into inventories
    inventory_updated: usize,
    /// Failed tasks
    failed: usize,
}

impl ApplyOutcome {
    /// The counters of this pass.
    pub fn counts(&self) -> ApplyCounts {
        ApplyCounts {
            images_written: self.images_written,
            yaml_updated: self.yaml_updated,
            inventory_updated: self.inventory_updated,
            failed: self.failed,
        }
    }
}

enum Applied {
    Image { path: PathBuf },
    Analysis,
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn target_not_found(message: String) -> mythic_error::MythicError {
    BatchError::new(BatchErrorKind::TargetNotFound(message)).into()
}

/// Streams result files and reconciles each line with its task.
pub struct ResultApplier {
    entities: Arc<dyn EntityStore>,
    create_backups: bool,
}

impl ResultApplier {
    /// Create an applier writing through `entities`.
    pub fn new(entities: Arc<dyn EntityStore>, create_backups: bool) -> Self {
        Self {
            entities,
            create_backups,
        }
    }

    /// Apply every result file in order.
    ///
    /// Per-line problems never abort the stream. Tasks in `excluded` and plan
    /// tasks without a result line are reported as failed as well, so every
    /// plan task ends up with exactly one result.
    ///
    /// # Errors
    ///
    /// Only a result file that cannot be read stops the apply.
    #[instrument(skip_all, fields(run_id = %state.run_id(), files = files.len()))]
    pub async fn apply(
        &self,
        plan: &Plan,
        state: &RunState,
        files: &[PathBuf],
        excluded: &BTreeMap<String, TaskError>,
    ) -> MythicResult<ApplyOutcome> {
        let index = plan.task_index();
        let job_for_key: HashMap<&str, &str> = state
            .jobs()
            .iter()
            .flat_map(|job| {
                job.task_keys()
                    .iter()
                    .map(move |key| (key.as_str(), job.job_id().as_str()))
            })
            .collect();

        let mut outcome = ApplyOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();

        for file in files {
            debug!(file = %file.display(), "Applying result file");
            let mut reader = ResultReader::open(file).await?;
            while let Some(line) = reader.next_line().await? {
                let decoded = match line {
                    ReadLine::Decoded(decoded) => decoded,
                    ReadLine::Malformed { line_no, error } => {
                        warn!(file = %file.display(), line_no, error = %error, "Skipping malformed result line");
                        outcome
                            .errors
                            .push(format!("{} line {}: {}", file.display(), line_no, error));
                        continue;
                    }
                };

                let Some(task) = index.get(decoded.custom_id.as_str()).copied() else {
                    error!(custom_id = %decoded.custom_id, "Result key matches no task in the plan");
                    outcome
                        .errors
                        .push(format!("Unknown task key in results: {}", decoded.custom_id));
                    continue;
                };

                if !seen.insert(task.key().clone()) {
                    warn!(task_key = %task.key(), "Duplicate result line, keeping the first");
                    continue;
                }

                let job_id = job_for_key.get(task.key().as_str()).map(|j| j.to_string());
                match self.apply_one(task, &decoded, state.run_id()).await {
                    Ok(Applied::Image { path }) => {
                        outcome.images_written += 1;
                        outcome.inventory_updated += 1;
                        outcome.results.push(TaskResult::success(
                            task.key().clone(),
                            Some(path),
                            decoded.provider_metadata.clone(),
                        ));
                    }
                    Ok(Applied::Analysis) => {
                        outcome.yaml_updated += 1;
                        outcome.results.push(TaskResult::success(
                            task.key().clone(),
                            None,
                            decoded.provider_metadata.clone(),
                        ));
                    }
                    Err(task_error) => {
                        self.record_failure(
                            &mut outcome,
                            plan,
                            task,
                            task_error,
                            job_id,
                            Some(decoded.raw.clone()),
                        );
                    }
                }
            }
        }

        for task in plan.tasks() {
            if seen.contains(task.key()) {
                continue;
            }
            let (task_error, job_id) = if let Some(reason) = excluded.get(task.key()) {
                (reason.clone(), None)
            } else if let Some(job_id) = job_for_key.get(task.key().as_str()) {
                let job_error = state
                    .jobs()
                    .iter()
                    .find(|j| j.job_id() == job_id)
                    .and_then(|j| j.error().clone());
                let message = match job_error {
                    Some(e) => format!("Job {} produced no result for this task: {}", job_id, e),
                    None => format!("Job {} produced no result for this task", job_id),
                };
                (TaskError::new(NO_RESULT, message, true), Some(job_id.to_string()))
            } else {
                (
                    TaskError::new(NOT_SUBMITTED, "Task was never submitted in this run", true),
                    None,
                )
            };
            self.record_failure(&mut outcome, plan, task, task_error, job_id, None);
        }

        info!(
            images_written = outcome.images_written,
            yaml_updated = outcome.yaml_updated,
            inventory_updated = outcome.inventory_updated,
            failed = outcome.failed,
            errors = outcome.errors.len(),
            "Apply finished"
        );
        Ok(outcome)
    }

    fn record_failure(
        &self,
        outcome: &mut ApplyOutcome,
        plan: &Plan,
        task: &Task,
        task_error: TaskError,
        job_id: Option<String>,
        raw: Option<String>,
    ) {
        warn!(task_key = %task.key(), code = %task_error.code, retryable = task_error.retryable, message = %task_error.message, "Task failed");
        let attempts = plan.attempts_for(task.key()) + 1;
        outcome.dlq.push(DlqEntry::new(
            task.clone(),
            &task_error,
            attempts,
            job_id,
            raw,
        ));
        outcome
            .results
            .push(TaskResult::failed(task.key().clone(), task_error));
        outcome.failed += 1;
    }

    async fn apply_one(
        &self,
        task: &Task,
        decoded: &DecodedResult,
        run_id: &str,
    ) -> Result<Applied, TaskError> {
        match (&decoded.kind, task.kind()) {
            (ResultKind::Error { code, message, status }, _) => Err(TaskError::new(
                code.clone(),
                message.clone(),
                is_retryable_code(code, status.as_deref()),
            )),
            (ResultKind::Empty, _) => Err(TaskError::new(
                EMPTY_RESPONSE,
                "Response contained no content",
                true,
            )),
            (ResultKind::Text(_), TaskKind::Generate) => Err(TaskError::new(
                NO_IMAGE_DATA,
                "Response did not contain image data",
                false,
            )),
            (ResultKind::Image { mime, .. }, TaskKind::Analyze) => Err(TaskError::new(
                UNEXPECTED_PAYLOAD,
                format!("Analysis task received image data ({})", mime),
                false,
            )),
            (ResultKind::Text(text), TaskKind::Analyze) => self
                .apply_analysis(task, text)
                .await
                .map(|()| Applied::Analysis)
                .map_err(|e| TaskError::new(ANALYSIS_FAILED, e.to_string(), false)),
            (ResultKind::Image { mime, bytes }, TaskKind::Generate) => {
                let path = task.output_path(extension_for(mime));
                write_atomic(&path, bytes)
                    .await
                    .map_err(|e| TaskError::new(APPLY_FAILED, e.to_string(), false))?;
                debug!(task_key = %task.key(), path = %path.display(), bytes = bytes.len(), "Wrote image");
                self.merge_generated(task, &path, run_id)
                    .await
                    .map_err(|e| TaskError::new(APPLY_FAILED, e.to_string(), false))?;
                Ok(Applied::Image { path })
            }
        }
    }

    async fn backup(&self, entity_type: EntityType, slug: &str, document: EntityDocument) {
        if !self.create_backups {
            return;
        }
        if let Err(e) = self.entities.backup(entity_type, slug, document).await {
            warn!(entity_type = %entity_type, slug, error = %e, "Backup failed, writing anyway");
        }
    }

    async fn write_document(
        &self,
        entity_type: EntityType,
        slug: &str,
        document: EntityDocument,
        doc: &Value,
    ) -> MythicResult<()> {
        self.backup(entity_type, slug, document).await;
        self.entities.write(entity_type, slug, document, doc).await
    }

    async fn merge_generated(&self, task: &Task, path: &Path, run_id: &str) -> MythicResult<()> {
        let entity_type = *task.entity_type();
        let slug = task.entity_slug().as_str();
        let entity_dir = self.entities.entity_dir(entity_type, slug);
        let entry = build_generated_entry(task, path, &entity_dir, run_id);

        let existing = self
            .entities
            .read(entity_type, slug, EntityDocument::Imagery)
            .await?;
        let mut doc = match (entity_type, existing) {
            (_, Some(doc)) => doc,
            (EntityType::Character, None) => new_character_document(slug),
            (_, None) => {
                return Err(target_not_found(format!(
                    "no {} for {} {}",
                    EntityDocument::Imagery.file_name(),
                    entity_type,
                    slug
                )));
            }
        };

        match entity_type {
            EntityType::Location => upsert_location_entry(&mut doc, task.target_id(), &entry)?,
            EntityType::Chapter => upsert_chapter_entry(&mut doc, task.target_id(), &entry)?,
            EntityType::Character => upsert_character_entry(&mut doc, &entry, None)?,
        };
        self.write_document(entity_type, slug, EntityDocument::Imagery, &doc)
            .await?;

        if entity_type != EntityType::Location {
            let runs = self
                .entities
                .read(entity_type, slug, EntityDocument::Runs)
                .await?;
            let record = RunRecord::new(task, path, run_id);
            let runs = upsert_run_record(runs, entity_type, slug, &record)?;
            self.write_document(entity_type, slug, EntityDocument::Runs, &runs)
                .await?;
        }
        Ok(())
    }

    async fn apply_analysis(&self, task: &Task, text: &str) -> MythicResult<()> {
        let entity_type = *task.entity_type();
        let slug = task.entity_slug().as_str();

        match task.metadata_str("analysis_type") {
            Some("appearance") => {
                let mut doc = self
                    .entities
                    .read(entity_type, slug, EntityDocument::Imagery)
                    .await?
                    .unwrap_or_else(|| new_character_document(slug));
                set_appearance(&mut doc, text)?;
                self.write_document(entity_type, slug, EntityDocument::Imagery, &doc)
                    .await
            }
            Some("image_analysis") => {
                // Validate before touching the document so bad payloads never land.
                let entry = InventoryEntry::parse_analysis(text)?;
                let mut doc = self
                    .entities
                    .read(entity_type, slug, EntityDocument::Imagery)
                    .await?
                    .ok_or_else(|| {
                        target_not_found(format!(
                            "no {} for {} {}, run appearance extraction first",
                            EntityDocument::Imagery.file_name(),
                            entity_type,
                            slug
                        ))
                    })?;
                upsert_character_entry(&mut doc, &entry, task.metadata_str("filename"))?;
                self.write_document(entity_type, slug, EntityDocument::Imagery, &doc)
                    .await
            }
            other => Err(BatchError::new(BatchErrorKind::Validation(format!(
                "Unknown analysis type: {}",
                other.unwrap_or("<none>")
            )))
            .into()),
        }
    }
}
