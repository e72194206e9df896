//! FFprobe artifact inspection.

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{MediaError, MediaResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Media duration of `path` in seconds, if ffprobe reports one.
///
/// Still images and some raw streams have no duration; those yield `Ok(None)`.
pub async fn probe_duration(ffprobe: impl AsRef<Path>, path: impl AsRef<Path>) -> MediaResult<Option<f64>> {
    let ffprobe = ffprobe.as_ref();
    let path = path.as_ref();

    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| MediaError::TimedOut(PROBE_TIMEOUT))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MediaError::EngineNotFound(ffprobe.display().to_string())
            }
            _ => MediaError::Io(e),
        })?;

    if !output.status.success() {
        return Err(MediaError::ProbeFailed {
            message: format!("ffprobe exited with {}", output.status),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    parse_duration(&output.stdout)
}

fn parse_duration(stdout: &[u8]) -> MediaResult<Option<f64>> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;
    Ok(probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0))
}
