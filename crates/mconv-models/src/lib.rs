//! Shared data models for the media conversion pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their operations and target formats
//! - Job status and the allowed lifecycle transitions
//! - Outcomes reported back to the bot layer

pub mod error;
pub mod job;
pub mod job_status;
pub mod outcome;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use job::{Job, JobId, MediaSource, Operation, TargetFormat};
pub use job_status::JobStatus;
pub use outcome::{Artifact, FailureDetail, FailureKind, Outcome};
