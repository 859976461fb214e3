//! Configuration error types.

use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration error with source location.
///
/// Load failures name the `mythic.toml` that was being read. Validation
/// failures name the offending setting.
#[derive(Debug, Clone, derive_more::Error)]
pub struct ConfigError {
    /// Error message
    pub message: String,
    /// Configuration file being loaded, if one was involved
    pub config_file: Option<PathBuf>,
    /// Setting that failed validation
    pub setting: Option<&'static str>,
    /// Line number where the error occurred
    pub line: u32,
    /// File where the error occurred
    pub file: &'static str,
}

impl ConfigError {
    /// Create a new ConfigError with the given message at the current location.
    ///
    /// # Examples
    ///
    /// ```
    /// use mythic_error::ConfigError;
    ///
    /// let err = ConfigError::new("Failed to build layered configuration");
    /// assert!(err.config_file.is_none());
    /// ```
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            message: message.into(),
            config_file: None,
            setting: None,
            line: location.line(),
            file: location.file(),
        }
    }

    /// A configuration file could not be read or parsed.
    ///
    /// # Examples
    ///
    /// ```
    /// use mythic_error::ConfigError;
    /// use std::path::Path;
    ///
    /// let err = ConfigError::in_file(Path::new("mythic.toml"), "invalid type: string");
    /// assert!(err.to_string().contains("[mythic.toml]"));
    /// ```
    #[track_caller]
    pub fn in_file(config_file: &Path, message: impl Into<String>) -> Self {
        let mut err = Self::new(message);
        err.config_file = Some(config_file.to_path_buf());
        err
    }

    /// A loaded setting has an unusable value.
    ///
    /// # Examples
    ///
    /// ```
    /// use mythic_error::ConfigError;
    ///
    /// let err = ConfigError::invalid("upload_concurrency", "must be at least 1");
    /// assert_eq!(err.setting, Some("upload_concurrency"));
    /// assert!(err.to_string().contains("upload_concurrency must be at least 1"));
    /// ```
    #[track_caller]
    pub fn invalid(setting: &'static str, message: impl Into<String>) -> Self {
        let mut err = Self::new(message);
        err.setting = Some(setting);
        err
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration Error: ")?;
        if let Some(config_file) = &self.config_file {
            write!(f, "[{}] ", config_file.display())?;
        }
        if let Some(setting) = self.setting {
            write!(f, "{} ", setting)?;
        }
        write!(f, "{} at line {} in {}", self.message, self.line, self.file)
    }
}
