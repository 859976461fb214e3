//! Command-line interface module.
//!
//! This module provides the CLI structure and command handlers for the mythic binary.

mod commands;
mod inspect;
mod run;

pub use commands::{Cli, Commands};
pub use inspect::{show_dlq, show_report, show_runs, show_status, unlock};
pub use run::{run_plan, write_retry_plan};

use mythic::{BatchConfig, MythicResult};
use std::path::Path;

/// Load and validate the configuration.
///
/// An explicit file replaces the layered defaults entirely.
pub fn load_config(path: Option<&Path>) -> MythicResult<BatchConfig> {
    let config = match path {
        Some(path) => BatchConfig::from_file(path)?,
        None => BatchConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}
