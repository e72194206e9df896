//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::JobStatus;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the job's input media comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    /// A file already on local disk.
    Path { path: PathBuf },
    /// Raw bytes, streamed to the engine's stdin.
    Bytes { data: Vec<u8> },
}

impl MediaSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes { data: data.into() }
    }

    /// The local path, if this source is file-backed.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            MediaSource::Path { path } => Some(path),
            MediaSource::Bytes { .. } => None,
        }
    }
}

/// Output container and codec parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFormat {
    /// Container / file extension (mp4, mkv, mp3, m4a, ...)
    pub container: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,

    /// Audio bitrate in ffmpeg notation ("192k")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<String>,
}

impl TargetFormat {
    /// Container only, codecs left to the engine's defaults.
    pub fn container(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            video_codec: None,
            audio_codec: None,
            audio_bitrate: None,
        }
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = Some(codec.into());
        self
    }

    pub fn with_audio_codec(mut self, codec: impl Into<String>) -> Self {
        self.audio_codec = Some(codec.into());
        self
    }

    pub fn with_audio_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.audio_bitrate = Some(bitrate.into());
        self
    }
}

/// The transform requested for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Re-encode into another container/codec.
    Transcode { format: TargetFormat },

    /// Cut a time range out of the source.
    Trim {
        start_secs: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
        format: TargetFormat,
    },

    /// Drop video and keep the audio track only.
    ExtractAudio { format: TargetFormat },

    /// Rewrite container metadata without re-encoding.
    TagMetadata {
        tags: BTreeMap<String, String>,
        format: TargetFormat,
    },
}

impl Operation {
    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Transcode { .. } => "transcode",
            Operation::Trim { .. } => "trim",
            Operation::ExtractAudio { .. } => "extract_audio",
            Operation::TagMetadata { .. } => "tag_metadata",
        }
    }

    pub fn format(&self) -> &TargetFormat {
        match self {
            Operation::Transcode { format }
            | Operation::Trim { format, .. }
            | Operation::ExtractAudio { format }
            | Operation::TagMetadata { format, .. } => format,
        }
    }
}

/// A conversion request submitted by the bot layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Input media
    pub source: MediaSource,

    /// Requested transform
    pub operation: Operation,

    /// Human-readable name for the artifact (e.g. "Artist - Title")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// When the job was submitted
    pub submitted_at: DateTime<Utc>,

    /// Lifecycle status; changed only through [`Job::transition`]
    #[serde(default)]
    status: JobStatus,
}

impl Job {
    /// Create a new pending job.
    pub fn new(source: MediaSource, operation: Operation) -> Self {
        Self {
            id: JobId::new(),
            source,
            operation,
            label: None,
            submitted_at: Utc::now(),
            status: JobStatus::Pending,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Move the job to `next`, rejecting any backwards or sideways step.
    pub fn transition(&mut self, next: JobStatus) -> ModelResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
