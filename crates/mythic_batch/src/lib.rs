//! Resumable batch job orchestration.
//!
//! A batch run turns a [`Plan`](mythic_core::Plan) into provider jobs and
//! folds the results back into entity metadata. Every stage persists its
//! progress into the run directory, so an interrupted run can be picked up
//! again without resubmitting work.
//!
//! # Stages
//!
//! 1. [`RunLock`] guards the artifact directory
//! 2. [`ReferenceUploader`] stages reference images with bounded concurrency
//! 3. [`JobSubmitter`] partitions tasks into jobs and records each handle immediately
//! 4. [`JobExecutor`] polls jobs and downloads result files
//! 5. [`ResultApplier`] writes images and merges metadata
//! 6. DLQ and report files record what happened
//!
//! [`BatchPipeline`] drives all of them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod applier;
pub mod codes;
mod decoder;
mod dlq;
mod events;
mod executor;
mod files_cache;
mod inventory;
mod lock;
mod pipeline;
mod report;
mod state;
mod submitter;
mod uploader;

pub use applier::{ApplyCounts, ApplyOutcome, ResultApplier};
pub use decoder::{
    Candidate, Content, DecodedResult, InlineData, LineError, Part, ReadLine, ResponseBody,
    ResultKind, ResultLine, ResultReader, is_retryable_code,
};
pub use dlq::{
    DlqStats, build_retry_plan, dlq_stats, format_dlq_for_console, load_dlq, permanent_failures,
    retryable_entries, write_dlq,
};
pub use events::{PipelineEvent, PipelineObserver};
pub use executor::{DownloadOutcome, JobExecutor, JobProgress, result_file_name};
pub use files_cache::{FilesCache, FilesCacheEntry};
pub use inventory::{
    EntryContent, EntryStatus, EntryType, GenerationInfo, InventoryEntry, Provenance, RunRecord,
    RunReference, build_generated_entry, new_character_document, set_appearance,
    upsert_chapter_entry, upsert_character_entry, upsert_entry, upsert_location_entry,
    upsert_run_record,
};
pub use lock::{
    LockInfo, LockOutcome, RunLock, acquire_lock, check_lock, force_release_lock, release_lock,
};
pub use pipeline::{BatchPipeline, PipelineOutcome};
pub use report::{
    ReportFailure, ReportTiming, RunCounters, RunReport, format_duration, format_report,
    generate_report, load_report, quick_summary, save_report,
};
pub use state::{RunStateStore, generate_run_id};
pub use submitter::{JobSubmitter, SubmitOutcome};
pub use uploader::{ReferenceUploader, UploadOutcome, UploadProgress, UploadStats};
