//! Structured job logging.
//!
//! Every job event carries the same `job_id` and `operation` fields so a
//! job's lifecycle can be followed across workers in JSON logs.

use std::time::Duration;

use mconv_models::{JobId, Outcome};
use tracing::{error, info, warn, Span};

/// Logger bound to one job.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: &'static str,
}

impl JobLogger {
    pub fn new(job_id: &JobId, operation: &'static str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation,
        }
    }

    pub fn log_start(&self, command_line: &str) {
        info!(
            job_id = %self.job_id,
            operation = self.operation,
            "Job started: {}", command_line
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = self.operation,
            "Job error: {}", message
        );
    }

    /// Log the terminal status of the job.
    pub fn log_outcome(&self, outcome: &Outcome) {
        let elapsed_ms = outcome.duration().as_millis() as u64;
        match outcome.error() {
            None => info!(
                job_id = %self.job_id,
                operation = self.operation,
                elapsed_ms,
                artifact = ?outcome.artifact_path(),
                "Job {}", outcome.status()
            ),
            Some(detail) => warn!(
                job_id = %self.job_id,
                operation = self.operation,
                elapsed_ms,
                kind = detail.kind.as_str(),
                "Job {}: {}", outcome.status(), detail.message
            ),
        }
    }

    pub fn log_slow(&self, elapsed: Duration, timeout: Duration) {
        if elapsed > timeout / 2 {
            warn!(
                job_id = %self.job_id,
                operation = self.operation,
                "Engine used {:?} of its {:?} budget", elapsed, timeout
            );
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    /// Span wrapping all events emitted while the job runs.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = self.operation
        )
    }
}
