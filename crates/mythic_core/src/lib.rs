//! Core data types for the Mythic batch pipeline.
//!
//! This crate provides the data model shared by every stage of a batch run:
//! tasks and their deterministic keys, plans, persisted run state, per-task
//! results, dead-letter entries, and the layered batch configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dlq;
mod plan;
mod result;
mod run;
mod task;
mod task_key;

pub use config::{BatchConfig, BatchConfigBuilder};
pub use dlq::{DlqEntry, DlqError};
pub use plan::{Plan, PlanSummary, Scope};
pub use result::{TaskError, TaskResult, TaskStatus};
pub use run::{JobInfo, JobState, PhaseTimestamps, RunPhase, RunState};
pub use task::{EntityType, ReferenceImage, ReferenceRole, Task, TaskBuilder, TaskConfig, TaskKind};
pub use task_key::{
    KeyComponents, ParsedTaskKey, compute_content_hash, display_key, generate_task_key,
    is_same_target, needs_regeneration, parse_task_key,
};
