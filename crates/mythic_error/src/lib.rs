//! Error types for the Mythic batch pipeline.
//!
//! This crate provides the foundation error types used throughout the Mythic workspace.
//!
//! # Error Hierarchy
//!
//! All errors follow the `ErrorKind` + wrapper struct pattern for clean error handling:
//! - `*ErrorKind` enum defines specific error conditions
//! - `*Error` struct wraps the kind with source location tracking
//! - All errors use `#[track_caller]` for automatic location capture
//!
//! # Examples
//!
//! ```
//! use mythic_error::{MythicResult, JsonError};
//!
//! fn parse_state() -> MythicResult<String> {
//!     Err(JsonError::new("expected value at line 1"))?
//! }
//!
//! match parse_state() {
//!     Ok(data) => println!("Got: {}", data),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod builder;
mod config;
mod error;
mod json;
mod provider;
mod storage;
mod yaml;

pub use batch::{BatchError, BatchErrorKind};
pub use builder::{BuilderError, BuilderErrorKind};
pub use config::ConfigError;
pub use error::{MythicError, MythicErrorKind, MythicResult};
pub use json::JsonError;
pub use provider::{ProviderError, ProviderErrorKind, RetryableError};
pub use storage::{StorageError, StorageErrorKind};
pub use yaml::YamlError;
