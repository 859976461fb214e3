//! Top-level error wrapper types.

use crate::{
    BatchError, BuilderError, ConfigError, JsonError, ProviderError, StorageError, YamlError,
};

/// Every error condition the workspace can produce.
///
/// # Examples
///
/// ```
/// use mythic_error::{MythicError, JsonError};
///
/// let json_err = JsonError::new("trailing comma");
/// let err: MythicError = json_err.into();
/// assert!(format!("{}", err).contains("JSON Error"));
/// ```
#[derive(Debug, derive_more::From, derive_more::Display, derive_more::Error)]
pub enum MythicErrorKind {
    /// JSON serialization/deserialization error
    #[from(JsonError)]
    Json(JsonError),
    /// YAML serialization/deserialization error
    #[from(YamlError)]
    Yaml(YamlError),
    /// Configuration error
    #[from(ConfigError)]
    Config(ConfigError),
    /// Builder error
    #[from(BuilderError)]
    Builder(BuilderError),
    /// Filesystem storage error
    #[from(StorageError)]
    Storage(StorageError),
    /// Batch provider error
    #[from(ProviderError)]
    Provider(ProviderError),
    /// Pipeline orchestration error
    #[from(BatchError)]
    Batch(BatchError),
}

/// Mythic error with kind discrimination.
///
/// # Examples
///
/// ```
/// use mythic_error::{MythicResult, ConfigError};
///
/// fn might_fail() -> MythicResult<()> {
///     Err(ConfigError::new("upload_concurrency must be positive"))?
/// }
///
/// assert!(might_fail().is_err());
/// ```
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("Mythic Error: {}", _0)]
pub struct MythicError(Box<MythicErrorKind>);

impl MythicError {
    /// Create a new error from a kind.
    pub fn new(kind: MythicErrorKind) -> Self {
        Self(Box::new(kind))
    }

    /// Get the error kind.
    pub fn kind(&self) -> &MythicErrorKind {
        &self.0
    }
}

// Generic From implementation for any type that converts to MythicErrorKind
impl<T> From<T> for MythicError
where
    T: Into<MythicErrorKind>,
{
    fn from(err: T) -> Self {
        Self::new(err.into())
    }
}

/// Result type for Mythic operations.
pub type MythicResult<T> = std::result::Result<T, MythicError>;
