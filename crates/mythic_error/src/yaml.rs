//! YAML error types.

/// YAML parse or emit failure for entity metadata documents.
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("YAML Error: {} at line {} in {}", message, line, file)]
pub struct YamlError {
    /// The underlying error message
    pub message: String,
    /// Line number where the error occurred
    pub line: u32,
    /// File where the error occurred
    pub file: &'static str,
}

impl YamlError {
    /// Create a new YamlError with the given message at the current location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: location.line(),
            file: location.file(),
        }
    }
}
