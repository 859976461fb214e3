//! Result file decoding.
//!
//! Each line of a result file is decoded exactly once into a [`ResultKind`];
//! everything downstream dispatches on that variant instead of re-inspecting
//! the raw JSON.

use crate::codes::INVALID_IMAGE_DATA;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mythic_error::{BatchError, BatchErrorKind, JsonError, MythicResult, ProviderErrorKind};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// One result line as the provider writes it.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultLine {
    /// Task key the request was submitted with
    pub custom_id: String,
    /// Generated content
    #[serde(default)]
    pub response: Option<ResponseBody>,
    /// Per-request failure
    #[serde(default)]
    pub error: Option<LineError>,
}

/// Generated content of a result line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    /// Candidate completions
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Token accounting
    #[serde(default)]
    pub usage_metadata: Option<JsonValue>,
}

/// One candidate completion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Content parts
    #[serde(default)]
    pub content: Option<Content>,
    /// Why generation stopped
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Content of a candidate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Content {
    /// Ordered parts
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A text or inline-data part.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Text content
    #[serde(default)]
    pub text: Option<String>,
    /// Inline binary content
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

/// Base64 payload with its MIME type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// MIME type, `image/png` when absent
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64 bytes
    pub data: String,
}

/// Per-request failure reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct LineError {
    /// Numeric status or symbolic code
    pub code: JsonValue,
    /// Message
    #[serde(default)]
    pub message: String,
    /// Symbolic status such as `RESOURCE_EXHAUSTED`
    #[serde(default)]
    pub status: Option<String>,
}

/// What a result line carries, decided once at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultKind {
    /// Decoded image bytes
    Image {
        /// MIME type
        mime: String,
        /// Raw bytes
        bytes: Vec<u8>,
    },
    /// Text output
    Text(String),
    /// Provider or decode failure
    Error {
        /// Code as a string
        code: String,
        /// Message
        message: String,
        /// Symbolic status, if the provider sent one
        status: Option<String>,
    },
    /// Nothing usable
    Empty,
}

impl ResultKind {
    /// Whether an `Error` variant should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResultKind::Error { code, status, .. } => is_retryable_code(code, status.as_deref()),
            _ => false,
        }
    }
}

/// A decoded result line.
#[derive(Debug, Clone)]
pub struct DecodedResult {
    /// Task key
    pub custom_id: String,
    /// Payload
    pub kind: ResultKind,
    /// Finish reason and usage, when present
    pub provider_metadata: Option<JsonValue>,
    /// The line as read
    pub raw: String,
}

fn is_transient_status(status: &str) -> bool {
    matches!(
        status,
        "RESOURCE_EXHAUSTED" | "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" | "RATE_LIMIT" | "TIMEOUT"
    )
}

/// Whether a provider error denotes a transient failure.
///
/// A symbolic status for throttling or server trouble decides first, since
/// gRPC-style providers pair it with a numeric code that is not an HTTP
/// status. Otherwise numeric codes follow the HTTP rule (429 and every 5xx),
/// and a symbolic code is checked like a status.
pub fn is_retryable_code(code: &str, status: Option<&str>) -> bool {
    if status.is_some_and(is_transient_status) {
        return true;
    }
    match code.parse::<u16>() {
        Ok(status_code) => ProviderErrorKind::Http {
            status_code,
            message: String::new(),
        }
        .is_retryable(),
        Err(_) => is_transient_status(code),
    }
}

fn code_string(code: &JsonValue) -> String {
    match code {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl DecodedResult {
    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns a `JsonError` if the line is not a result object.
    pub fn decode(line: &str) -> MythicResult<Self> {
        let parsed: ResultLine = serde_json::from_str(line)
            .map_err(|e| JsonError::new(format!("Malformed result line: {}", e)))?;

        let provider_metadata = parsed.response.as_ref().and_then(|response| {
            let finish_reason = response
                .candidates
                .first()
                .and_then(|c| c.finish_reason.clone());
            if finish_reason.is_none() && response.usage_metadata.is_none() {
                return None;
            }
            Some(serde_json::json!({
                "finish_reason": finish_reason,
                "usage_metadata": response.usage_metadata,
            }))
        });

        let kind = classify(&parsed);

        Ok(Self {
            custom_id: parsed.custom_id,
            kind,
            provider_metadata,
            raw: line.to_string(),
        })
    }
}

fn classify(line: &ResultLine) -> ResultKind {
    if let Some(error) = &line.error {
        return ResultKind::Error {
            code: code_string(&error.code),
            message: error.message.clone(),
            status: error.status.clone(),
        };
    }

    let parts: Vec<&Part> = line
        .response
        .iter()
        .flat_map(|r| r.candidates.first())
        .flat_map(|c| c.content.iter())
        .flat_map(|c| c.parts.iter())
        .collect();

    if let Some(inline) = parts.iter().find_map(|p| p.inline_data.as_ref()) {
        return match STANDARD.decode(inline.data.trim()) {
            Ok(bytes) if !bytes.is_empty() => ResultKind::Image {
                mime: inline
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "image/png".to_string()),
                bytes,
            },
            Ok(_) => ResultKind::Empty,
            Err(e) => ResultKind::Error {
                code: INVALID_IMAGE_DATA.to_string(),
                message: format!("Inline data is not valid base64: {}", e),
                status: None,
            },
        };
    }

    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if text.trim().is_empty() {
        ResultKind::Empty
    } else {
        ResultKind::Text(text)
    }
}

/// A line from a result file.
#[derive(Debug)]
pub enum ReadLine {
    /// Decoded successfully
    Decoded(DecodedResult),
    /// Could not be decoded; the stream continues
    Malformed {
        /// 1-based line number
        line_no: usize,
        /// Why decoding failed
        error: String,
    },
}

/// Streams a result file line by line without loading it whole.
pub struct ResultReader {
    path: PathBuf,
    lines: Lines<BufReader<tokio::fs::File>>,
    line_no: usize,
}

impl ResultReader {
    /// Open a result file.
    pub async fn open(path: &Path) -> MythicResult<Self> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            BatchError::new(BatchErrorKind::ResultStream(format!("{}: {}", path.display(), e)))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }

    /// The next non-blank line, or `None` at end of file.
    ///
    /// # Errors
    ///
    /// Only I/O failures are errors. Undecodable lines come back as
    /// [`ReadLine::Malformed`].
    pub async fn next_line(&mut self) -> MythicResult<Option<ReadLine>> {
        loop {
            let line = self.lines.next_line().await.map_err(|e| {
                BatchError::new(BatchErrorKind::ResultStream(format!(
                    "{} line {}: {}",
                    self.path.display(),
                    self.line_no + 1,
                    e
                )))
            })?;
            let Some(line) = line else {
                return Ok(None);
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(match DecodedResult::decode(&line) {
                Ok(decoded) => ReadLine::Decoded(decoded),
                Err(e) => ReadLine::Malformed {
                    line_no: self.line_no,
                    error: e.to_string(),
                },
            }));
        }
    }
}
