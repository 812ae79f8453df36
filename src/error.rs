//! Caller-facing validation failures.
//!
//! These are rejected before any capability is called and are never
//! retried. The HTTP layer maps each variant to a 4xx status.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("a filename is required")]
    MissingFilename,
    #[error("only {expected} files are supported (got '{filename}')")]
    UnsupportedFileType {
        filename: String,
        expected: &'static str,
    },
    #[error("uploaded file is empty")]
    EmptyUpload,
    #[error("file too large: {size} bytes (limit {limit} bytes)")]
    UploadTooLarge { size: usize, limit: usize },
    #[error("file must be UTF-8 encoded")]
    NotUtf8,
    #[error("no valid JSON objects found in file")]
    NoValidLines,
}

impl ValidationError {
    /// Machine-readable code used in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedFileType { .. } => "unsupported_media_type",
            ValidationError::UploadTooLarge { .. } => "payload_too_large",
            _ => "bad_request",
        }
    }
}

/// Trim a query and reject it if nothing is left.
pub fn validate_query(raw: &str) -> Result<&str, ValidationError> {
    let query = raw.trim();
    if query.is_empty() {
        return Err(ValidationError::EmptyQuery);
    }
    Ok(query)
}
