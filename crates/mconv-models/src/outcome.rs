//! Final, immutable result records for jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ModelError, ModelResult};
use crate::{JobId, JobStatus};

/// The file produced by a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Media duration reported by ffprobe, when probing is enabled and worked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// Why a job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TimedOut,
    ProcessingFailed,
    ResourceLimit,
    EngineNotFound,
    InvalidRequest,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TimedOut => "timed_out",
            FailureKind::ProcessingFailed => "processing_failed",
            FailureKind::ResourceLimit => "resource_limit",
            FailureKind::EngineNotFound => "engine_not_found",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

/// Error detail carried by failed and cancelled outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
    /// Captured engine output (tail), verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }
}

/// Result of one job. Produced exactly once per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    job_id: JobId,
    status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<FailureDetail>,
    duration_ms: u64,
    finished_at: DateTime<Utc>,
}

impl Outcome {
    /// Build an outcome, checking that `status` is terminal.
    pub fn new(
        job_id: JobId,
        status: JobStatus,
        artifact: Option<Artifact>,
        error: Option<FailureDetail>,
        elapsed: Duration,
    ) -> ModelResult<Self> {
        if !status.is_terminal() {
            return Err(ModelError::NonTerminalOutcome(status));
        }
        Ok(Self::terminal(job_id, status, artifact, error, elapsed))
    }

    pub fn succeeded(job_id: JobId, artifact: Artifact, elapsed: Duration) -> Self {
        Self::terminal(job_id, JobStatus::Succeeded, Some(artifact), None, elapsed)
    }

    /// Successful job whose invocation declared no output file.
    pub fn completed(job_id: JobId, elapsed: Duration) -> Self {
        Self::terminal(job_id, JobStatus::Succeeded, None, None, elapsed)
    }

    pub fn failed(job_id: JobId, error: FailureDetail, elapsed: Duration) -> Self {
        Self::terminal(job_id, JobStatus::Failed, None, Some(error), elapsed)
    }

    pub fn cancelled(job_id: JobId, reason: impl Into<String>, elapsed: Duration) -> Self {
        let detail = FailureDetail::new(FailureKind::Cancelled, reason);
        Self::terminal(job_id, JobStatus::Cancelled, None, Some(detail), elapsed)
    }

    fn terminal(
        job_id: JobId,
        status: JobStatus,
        artifact: Option<Artifact>,
        error: Option<FailureDetail>,
        elapsed: Duration,
    ) -> Self {
        Self {
            job_id,
            status,
            artifact,
            error,
            duration_ms: elapsed.as_millis() as u64,
            finished_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact.as_ref().map(|a| a.path.as_path())
    }

    pub fn error(&self) -> Option<&FailureDetail> {
        self.error.as_ref()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}
