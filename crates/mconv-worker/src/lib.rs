//! Media conversion worker.
//!
//! This crate provides:
//! - A fixed-size worker pool driving jobs through the engine runner
//! - Idempotent, retrying outcome delivery to the bot layer
//! - Structured job logging and Prometheus metrics
//! - Health check routes and graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod intake;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod sink;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{ShutdownReport, WorkerPool};
pub use intake::JobRequest;
pub use logging::JobLogger;
pub use sink::{
    ChannelHandler, DeliveryConfig, DeliveryError, DeliveryReceipt, DeliveryStatus, LogHandler,
    OutcomeHandler, ResultSink,
};
