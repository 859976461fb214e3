//! Mythic - batch imagery for worldbuilding content
//!
//! Mythic turns planned image generation and analysis tasks into provider
//! batch jobs, survives interruption at any point, and folds the results back
//! into the YAML documents that describe characters, locations, and chapters.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mythic::{BatchConfig, BatchPipeline, FileSpoolBatchClient, FileSystemEntityStore,
//!     FileSystemReferenceStore, PipelineOutcome};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig::load()?;
//!     let pipeline = BatchPipeline::from_config(
//!         &config,
//!         Arc::new(FileSpoolBatchClient::new("spool")?),
//!         Arc::new(FileSystemReferenceStore::new(config.artifact_dir().join("staged"))?),
//!         Arc::new(FileSystemEntityStore::new("content")),
//!     );
//!     let plan = mythic::read_json("plan.json".as_ref()).await?.expect("plan exists");
//!     if let PipelineOutcome::Completed(report) = pipeline.execute(&plan).await? {
//!         println!("{}", mythic::format_report(&report));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `mythic_error` - Error types
//! - `mythic_core` - Tasks, plans, run state, configuration
//! - `mythic_interface` - Collaborator traits (batch provider, reference and entity stores)
//! - `mythic_storage` - Filesystem implementations of the collaborators
//! - `mythic_batch` - The resumable pipeline
//!
//! This crate (`mythic`) re-exports everything for convenience.

pub use mythic_batch::*;
pub use mythic_core::*;
pub use mythic_error::*;
pub use mythic_interface::*;
pub use mythic_storage::*;

pub mod telemetry;
