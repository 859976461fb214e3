//! Filesystem backends for the Mythic batch pipeline.
//!
//! # Features
//!
//! - **Content-addressable reference staging**: files stored by SHA-256 hash for automatic deduplication
//! - **YAML entity store**: per-entity `imagery.yaml` / `imagery.runs.yaml` with `.bak` backups
//! - **Spool batch client**: a directory-backed job queue for offline runs and tests
//! - **Atomic operations**: every write goes through a temp file and a rename

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod atomic;
mod entity;
mod hashing;
mod reference;
mod spool;

pub use atomic::{read_json, write_atomic, write_json};
pub use entity::FileSystemEntityStore;
pub use hashing::{compute_hash, hash_file};
pub use reference::FileSystemReferenceStore;
pub use spool::FileSpoolBatchClient;
