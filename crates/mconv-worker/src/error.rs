//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    Media(#[from] mconv_media::MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] mconv_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// The queue is full; the caller should reject or defer the request.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, WorkerError::Queue(e) if e.is_backpressure())
    }
}
