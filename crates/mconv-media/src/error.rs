//! Error types for media operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while planning or running an engine invocation.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Engine not found: {0}")]
    EngineNotFound(String),

    #[error("Engine exited unsuccessfully: {message}")]
    ProcessingFailed {
        message: String,
        diagnostics: String,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    ProbeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create an engine failure error.
    pub fn processing_failed(
        message: impl Into<String>,
        diagnostics: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ProcessingFailed {
            message: message.into(),
            diagnostics: diagnostics.into(),
            exit_code,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// True for errors caused by the request itself rather than the engine.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MediaError::InvalidRequest(_)
                | MediaError::UnsupportedFormat(_)
                | MediaError::SecurityViolation(_)
                | MediaError::FileNotFound(_)
        )
    }
}
