//! JSON error types.
//!
//! Run state, plans, lock files, DLQ files and result lines are all JSON. The
//! error records which of those documents failed when it is known.

use std::fmt;
use std::path::{Path, PathBuf};

/// JSON encode or decode failure with source location.
#[derive(Debug, Clone, derive_more::Error)]
pub struct JsonError {
    /// The underlying error message
    pub message: String,
    /// Document that failed to encode or decode, when it is a file
    pub document: Option<PathBuf>,
    /// Line number where the error occurred
    pub line: u32,
    /// File where the error occurred
    pub file: &'static str,
}

impl JsonError {
    /// Error not tied to a file, such as a malformed result line.
    ///
    /// # Examples
    ///
    /// ```
    /// use mythic_error::JsonError;
    ///
    /// let err = JsonError::new("Malformed result line: expected `,` or `}`");
    /// assert!(err.document.is_none());
    /// assert!(err.to_string().starts_with("JSON Error: Malformed result line"));
    /// ```
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            message: message.into(),
            document: None,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Error reading or writing the JSON document at `document`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mythic_error::JsonError;
    /// use std::path::Path;
    ///
    /// let err = JsonError::in_document(Path::new(".mythic/batch/.lock"), "EOF while parsing");
    /// assert_eq!(err.document.as_deref(), Some(Path::new(".mythic/batch/.lock")));
    /// assert!(err.to_string().contains("(.mythic/batch/.lock)"));
    /// ```
    #[track_caller]
    pub fn in_document(document: &Path, message: impl Into<String>) -> Self {
        let mut err = Self::new(message);
        err.document = Some(document.to_path_buf());
        err
    }
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON Error: {}", self.message)?;
        if let Some(document) = &self.document {
            write!(f, " ({})", document.display())?;
        }
        write!(f, " at line {} in {}", self.line, self.file)
    }
}
