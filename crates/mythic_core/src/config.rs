//! Batch configuration.
//!
//! Configuration is layered with the `config` crate:
//! - Bundled defaults (include_str! from mythic.toml)
//! - User overrides (~/.config/mythic/mythic.toml, then ./mythic.toml)
//! - Later sources override earlier ones field by field

use config::{Config, File, FileFormat};
use mythic_error::{ConfigError, MythicError, MythicResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Settings for one batch run.
///
/// # Examples
///
/// ```
/// use mythic_core::BatchConfig;
///
/// let config = BatchConfig::default().with_upload_concurrency(2usize);
/// assert_eq!(*config.upload_concurrency(), 2);
/// assert_eq!(*config.max_tasks_per_job(), 500);
/// ```
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    derive_getters::Getters,
    derive_setters::Setters,
    derive_builder::Builder,
)]
#[setters(prefix = "with_")]
#[builder(default, setter(into))]
pub struct BatchConfig {
    /// Model used when a task does not name one
    #[serde(default = "default_model")]
    model: String,

    /// Interval between job polls (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,

    /// Maximum tasks submitted in one provider job
    #[serde(default = "default_max_tasks_per_job")]
    max_tasks_per_job: usize,

    /// Reference uploads in flight at once
    #[serde(default = "default_upload_concurrency")]
    upload_concurrency: usize,

    /// Attempts before a dead-lettered task counts as permanent
    #[serde(default = "default_max_retries")]
    max_retries: u32,

    /// Initial upload retry backoff (milliseconds)
    #[serde(default = "default_upload_base_delay_ms")]
    upload_base_delay_ms: u64,

    /// Upper bound on upload retry backoff (milliseconds)
    #[serde(default = "default_upload_max_delay_ms")]
    upload_max_delay_ms: u64,

    /// Remove staged references once a run completes
    #[serde(default = "default_true")]
    cleanup_after_success: bool,

    /// Copy entity YAML to a `.bak` sibling before modifying it
    #[serde(default = "default_true")]
    create_backups: bool,

    /// Root directory for run artifacts
    #[serde(default = "default_artifact_dir")]
    artifact_dir: PathBuf,
}

fn default_model() -> String {
    "gemini-3-pro-image-preview".to_string()
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_max_tasks_per_job() -> usize {
    500
}

fn default_upload_concurrency() -> usize {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_upload_base_delay_ms() -> u64 {
    1_000
}

fn default_upload_max_delay_ms() -> u64 {
    16_000
}

fn default_true() -> bool {
    true
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".mythic/batch")
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            poll_interval_ms: default_poll_interval_ms(),
            max_tasks_per_job: default_max_tasks_per_job(),
            upload_concurrency: default_upload_concurrency(),
            max_retries: default_max_retries(),
            upload_base_delay_ms: default_upload_base_delay_ms(),
            upload_max_delay_ms: default_upload_max_delay_ms(),
            cleanup_after_success: true,
            create_backups: true,
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl BatchConfig {
    /// Creates a new config builder.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    /// Load configuration from a specific file path.
    ///
    /// Fields missing from the file take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> MythicResult<Self> {
        debug!("Loading batch configuration from file");

        let config: Self = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .map_err(|e| {
                MythicError::from(ConfigError::in_file(
                    path.as_ref(),
                    format!("Failed to read configuration: {}", e),
                ))
            })?
            .try_deserialize()
            .map_err(|e| {
                MythicError::from(ConfigError::in_file(
                    path.as_ref(),
                    format!("Failed to parse configuration: {}", e),
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with precedence: current dir > home dir > bundled defaults.
    ///
    /// User config files are optional and silently skipped if not found.
    #[instrument]
    pub fn load() -> MythicResult<Self> {
        debug!("Loading batch configuration with precedence: current dir > home dir > bundled defaults");

        const DEFAULT_CONFIG: &str = include_str!("../../../mythic.toml");

        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".config/mythic/mythic.toml");
            builder = builder.add_source(File::from(home_config).required(false));
        }

        builder = builder.add_source(File::with_name("mythic").required(false));

        let config: Self = builder
            .build()
            .map_err(|e| {
                MythicError::from(ConfigError::new(format!(
                    "Failed to build configuration: {}",
                    e
                )))
            })?
            .try_deserialize()
            .map_err(|e| {
                MythicError::from(ConfigError::new(format!(
                    "Failed to parse configuration: {}",
                    e
                )))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the offending field.
    pub fn validate(&self) -> MythicResult<()> {
        if self.upload_concurrency == 0 {
            return Err(ConfigError::invalid("upload_concurrency", "must be at least 1").into());
        }
        if self.max_tasks_per_job == 0 {
            return Err(ConfigError::invalid("max_tasks_per_job", "must be at least 1").into());
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive").into());
        }
        if self.upload_base_delay_ms > self.upload_max_delay_ms {
            return Err(ConfigError::invalid(
                "upload_base_delay_ms",
                "must not exceed upload_max_delay_ms",
            )
            .into());
        }
        Ok(())
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
