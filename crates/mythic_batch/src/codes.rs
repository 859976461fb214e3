//! Symbolic error codes recorded on failed tasks.
//!
//! Provider errors keep the provider's own code (usually an HTTP status).
//! Everything the pipeline detects itself uses one of these.

/// A mandatory reference image could not be staged
pub const REFERENCE_UPLOAD_FAILED: &str = "REFERENCE_UPLOAD_FAILED";
/// Inline image bytes were not valid base64
pub const INVALID_IMAGE_DATA: &str = "INVALID_IMAGE_DATA";
/// A generate task received text instead of an image
pub const NO_IMAGE_DATA: &str = "NO_IMAGE_DATA";
/// An analyze task received an image instead of text
pub const UNEXPECTED_PAYLOAD: &str = "UNEXPECTED_PAYLOAD";
/// The response carried no usable content
pub const EMPTY_RESPONSE: &str = "EMPTY_RESPONSE";
/// Analysis text could not be parsed, validated, or merged
pub const ANALYSIS_FAILED: &str = "ANALYSIS_FAILED";
/// A submitted task has no line in any result file
pub const NO_RESULT: &str = "NO_RESULT";
/// A planned task was never part of a submitted job
pub const NOT_SUBMITTED: &str = "NOT_SUBMITTED";
/// Writing an image or metadata file failed
pub const APPLY_FAILED: &str = "APPLY_FAILED";
