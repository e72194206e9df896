//! Line-delimited JSON job requests.
//!
//! The binary reads one request per line on stdin; a bot host would build
//! [`Job`]s directly instead.

use mconv_models::{Job, JobId, MediaSource, Operation};
use serde::Deserialize;

/// One conversion request.
///
/// ```json
/// {"source": {"kind": "path", "path": "in.mkv"},
///  "operation": {"type": "extract_audio", "format": {"container": "mp3"}},
///  "label": "Artist - Title"}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub source: MediaSource,
    pub operation: Operation,
    #[serde(default)]
    pub label: Option<String>,
}

impl JobRequest {
    /// Parse a request line. Blank lines yield `Ok(None)`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }

    pub fn into_job(self) -> Job {
        let mut job = Job::new(self.source, self.operation);
        if let Some(id) = self.id {
            job.id = JobId::from_string(id);
        }
        if let Some(label) = self.label {
            job = job.with_label(label);
        }
        job
    }
}
