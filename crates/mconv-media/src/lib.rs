//! FFmpeg process supervision for media conversion jobs.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - A process runner with timeout, cancellation and guaranteed teardown
//! - Resource limits applied to the engine process
//! - Job-to-invocation planning and input validation
//! - FFprobe duration lookup

pub mod command;
pub mod error;
pub mod limits;
pub mod planner;
pub mod probe;
pub mod runner;
pub mod security;

pub use command::{FfmpegCommand, Invocation};
pub use error::{MediaError, MediaResult};
pub use limits::ResourceLimits;
pub use planner::{FfmpegPlanner, InvocationPlanner};
pub use probe::probe_duration;
pub use runner::{check_engine, ProcessRunner, RunReport};
pub use security::{sanitize_filename, SecurityContext};
