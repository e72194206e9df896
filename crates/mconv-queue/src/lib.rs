//! Bounded in-process job queue.
//!
//! This crate provides:
//! - FIFO job queue with a hard capacity (backpressure, never blocks)
//! - Blocking dequeue that is released on shutdown
//! - Tracking of claimed jobs so running work can be cancelled

pub mod error;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use queue::{Cancellation, ClaimedJob, JobQueue, QueueConfig};
