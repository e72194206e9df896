//! Queue error types.

use mconv_models::{JobId, JobStatus};
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Queue is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Job already queued: {0}")]
    Duplicate(JobId),

    #[error("Job {id} is {status}, only pending jobs can be queued")]
    NotPending { id: JobId, status: JobStatus },
}

impl QueueError {
    /// Whether the caller should retry later rather than give up.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, QueueError::CapacityExceeded { .. })
    }
}
