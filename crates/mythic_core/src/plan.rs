//! Plans: the ordered task list for one invocation.

use crate::{BatchConfig, EntityType, Task, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Filters the planner applied when selecting work.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scope {
    /// Entity types included
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
    /// Specific slugs included, if filtered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_filter: Option<Vec<String>>,
    /// Task kinds included
    #[serde(default)]
    pub kinds: Vec<TaskKind>,
}

/// Summary statistics for a plan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, derive_getters::Getters)]
pub struct PlanSummary {
    /// Number of tasks
    total_tasks: usize,
    /// Tasks per entity type
    by_entity_type: BTreeMap<EntityType, usize>,
    /// Tasks per kind
    by_kind: BTreeMap<TaskKind, usize>,
    /// Targets the planner skipped because output already exists
    skipped_already_generated: usize,
}

impl PlanSummary {
    fn from_tasks(tasks: &[Task], skipped_already_generated: usize) -> Self {
        let mut by_entity_type = BTreeMap::new();
        let mut by_kind = BTreeMap::new();
        for task in tasks {
            *by_entity_type.entry(*task.entity_type()).or_insert(0) += 1;
            *by_kind.entry(*task.kind()).or_insert(0) += 1;
        }
        Self {
            total_tasks: tasks.len(),
            by_entity_type,
            by_kind,
            skipped_already_generated,
        }
    }
}

/// The full set of tasks for one run. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct Plan {
    /// Run this plan belongs to
    run_id: String,
    /// Creation timestamp
    created_at: DateTime<Utc>,
    /// Planner filters
    scope: Scope,
    /// Resolved configuration
    config: BatchConfig,
    /// Summary statistics
    summary: PlanSummary,
    /// Tasks in submission order
    tasks: Vec<Task>,
    /// Attempts already spent on a task key by earlier runs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    prior_attempts: HashMap<String, u32>,
}

impl Plan {
    /// Assemble a plan and compute its summary.
    pub fn new(
        run_id: impl Into<String>,
        scope: Scope,
        config: BatchConfig,
        tasks: Vec<Task>,
        skipped_already_generated: usize,
    ) -> Self {
        let summary = PlanSummary::from_tasks(&tasks, skipped_already_generated);
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            scope,
            config,
            summary,
            tasks,
            prior_attempts: HashMap::new(),
        }
    }

    /// Carry attempt counts over from earlier runs.
    pub fn with_prior_attempts(mut self, prior_attempts: HashMap<String, u32>) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }

    /// Look up a task by key.
    pub fn task(&self, key: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.key() == key)
    }

    /// Index of every task by key.
    pub fn task_index(&self) -> HashMap<&str, &Task> {
        self.tasks.iter().map(|t| (t.key().as_str(), t)).collect()
    }

    /// Attempts already spent on `key` before this run.
    pub fn attempts_for(&self, key: &str) -> u32 {
        self.prior_attempts.get(key).copied().unwrap_or(0)
    }
}
