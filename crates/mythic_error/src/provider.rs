//! Batch provider error types and retry classification.

/// Provider-side error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub enum ProviderErrorKind {
    /// HTTP error with status code and message
    #[display("HTTP {} error: {}", status_code, message)]
    Http {
        /// HTTP status code
        status_code: u16,
        /// Error message
        message: String,
    },
    /// Provider could not be reached
    #[display("Provider unavailable: {}", _0)]
    Unavailable(String),
    /// Provider rejected the submitted batch
    #[display("Batch rejected: {}", _0)]
    Rejected(String),
    /// Provider does not know the job
    #[display("Unknown job: {}", _0)]
    UnknownJob(String),
    /// Provider returned something that could not be interpreted
    #[display("Invalid provider response: {}", _0)]
    InvalidResponse(String),
}

impl ProviderErrorKind {
    /// Check if this error type should be retried.
    ///
    /// Rate limiting (429) and every server-side status (>= 500) are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderErrorKind::Http { status_code, .. } => is_retryable_status(*status_code),
            ProviderErrorKind::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Get retry strategy parameters for this error type.
    ///
    /// Returns `(initial_backoff_ms, max_retries, max_delay_secs)`.
    pub fn retry_strategy_params(&self) -> (u64, usize, u64) {
        match self {
            ProviderErrorKind::Http { status_code, .. } => match *status_code {
                429 => (5000, 3, 40),
                503 => (2000, 5, 60),
                500 | 502 | 504 => (1000, 3, 8),
                _ => (1000, 3, 16),
            },
            ProviderErrorKind::Unavailable(_) => (2000, 5, 60),
            _ => (1000, 3, 16),
        }
    }
}

/// Whether a provider status code denotes a transient failure.
///
/// # Examples
///
/// ```
/// use mythic_error::ProviderErrorKind;
///
/// let throttled = ProviderErrorKind::Http { status_code: 429, message: "slow down".into() };
/// let invalid = ProviderErrorKind::Http { status_code: 400, message: "bad request".into() };
/// assert!(throttled.is_retryable());
/// assert!(!invalid.is_retryable());
/// ```
fn is_retryable_status(status_code: u16) -> bool {
    status_code == 429 || status_code >= 500
}

/// Provider error with source location tracking.
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Provider Error: {} at line {} in {}", kind, line, file)]
pub struct ProviderError {
    /// The kind of error that occurred
    pub kind: ProviderErrorKind,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl ProviderError {
    /// Create a new ProviderError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: ProviderErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Shorthand for an HTTP-status error.
    #[track_caller]
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Http {
            status_code,
            message: message.into(),
        })
    }
}

/// Trait for errors that support retry logic.
///
/// # Examples
///
/// ```
/// use mythic_error::{ProviderError, RetryableError};
///
/// let err = ProviderError::http(503, "Service unavailable");
/// assert!(err.is_retryable());
/// let (backoff, retries, _max_delay) = err.retry_strategy_params();
/// assert_eq!(backoff, 2000);
/// assert_eq!(retries, 5);
/// ```
pub trait RetryableError {
    /// Returns true if this error should trigger a retry.
    fn is_retryable(&self) -> bool;

    /// Get retry strategy parameters for this error.
    ///
    /// Returns `(initial_backoff_ms, max_retries, max_delay_secs)`.
    fn retry_strategy_params(&self) -> (u64, usize, u64) {
        (1000, 3, 16)
    }
}

impl RetryableError for ProviderError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn retry_strategy_params(&self) -> (u64, usize, u64) {
        self.kind.retry_strategy_params()
    }
}

impl RetryableError for ProviderErrorKind {
    fn is_retryable(&self) -> bool {
        ProviderErrorKind::is_retryable(self)
    }

    fn retry_strategy_params(&self) -> (u64, usize, u64) {
        ProviderErrorKind::retry_strategy_params(self)
    }
}
