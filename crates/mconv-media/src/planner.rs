//! Turning jobs into engine invocations.

use std::path::{Path, PathBuf};

use mconv_models::{Job, MediaSource, Operation, TargetFormat};

use crate::command::{FfmpegCommand, Invocation};
use crate::error::{MediaError, MediaResult};
use crate::limits::ResourceLimits;
use crate::security::{sanitize_filename, SecurityContext};

/// Builds the concrete invocation for a job.
///
/// Implemented by [`FfmpegPlanner`]; closures `Fn(&Job) -> MediaResult<Invocation>`
/// also qualify, which lets hosts drive a different engine.
pub trait InvocationPlanner: Send + Sync {
    fn plan(&self, job: &Job) -> MediaResult<Invocation>;
}

impl<F> InvocationPlanner for F
where
    F: Fn(&Job) -> MediaResult<Invocation> + Send + Sync,
{
    fn plan(&self, job: &Job) -> MediaResult<Invocation> {
        self(job)
    }
}

/// Plans ffmpeg invocations for every [`Operation`].
#[derive(Debug, Clone)]
pub struct FfmpegPlanner {
    ffmpeg: PathBuf,
    output_dir: PathBuf,
    limits: ResourceLimits,
    security: SecurityContext,
}

impl FfmpegPlanner {
    pub fn new(ffmpeg: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            output_dir: output_dir.into(),
            limits: ResourceLimits::default(),
            security: SecurityContext::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_security(mut self, security: SecurityContext) -> Self {
        self.security = security;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where the artifact for `job` will be written.
    ///
    /// Relative output directories resolve against the worker's own working
    /// directory, the same base the engine sees.
    pub fn output_path(&self, job: &Job) -> PathBuf {
        let stem = job
            .label
            .as_deref()
            .or_else(|| {
                job.source
                    .as_path()
                    .and_then(|p| p.file_stem())
                    .and_then(|s| s.to_str())
            })
            .map(sanitize_filename)
            .unwrap_or_else(|| "output".to_string());

        let container = job.operation.format().container.to_lowercase();
        let id = sanitize_filename(job.id.as_str());
        self.output_dir
            .join(format!("{}_{}.{}", stem, id, container))
    }

    fn validate_source(&self, source: &MediaSource) -> MediaResult<()> {
        match source {
            MediaSource::Path { path } => {
                self.security.validate_path(path)?;
                // Blocking stat: `plan` is synchronous
                let metadata = std::fs::metadata(path)
                    .map_err(|_| MediaError::FileNotFound(path.clone()))?;
                self.security
                    .validate_file_size(metadata.len(), self.limits.input_bytes)
            }
            MediaSource::Bytes { data } => {
                if data.is_empty() {
                    return Err(MediaError::invalid_request("Empty media payload"));
                }
                self.security
                    .validate_file_size(data.len() as u64, self.limits.input_bytes)
            }
        }
    }
}

impl InvocationPlanner for FfmpegPlanner {
    fn plan(&self, job: &Job) -> MediaResult<Invocation> {
        let format = job.operation.format();
        self.security.validate_container(&format.container)?;
        self.validate_source(&job.source)?;

        let output = self.output_path(job);
        let cmd = match &job.source {
            MediaSource::Path { path } => FfmpegCommand::new(path, &output),
            MediaSource::Bytes { data } => FfmpegCommand::from_bytes(data.clone(), &output),
        };

        let cmd = match &job.operation {
            Operation::Transcode { format } => with_codecs(cmd, format),

            Operation::Trim {
                start_secs,
                duration_secs,
                format,
            } => {
                if !start_secs.is_finite() || *start_secs < 0.0 {
                    return Err(MediaError::invalid_request(format!(
                        "Invalid trim start: {}",
                        start_secs
                    )));
                }
                let mut cmd = cmd.seek(*start_secs);
                if let Some(duration) = duration_secs {
                    if !duration.is_finite() || *duration <= 0.0 {
                        return Err(MediaError::invalid_request(format!(
                            "Invalid trim duration: {}",
                            duration
                        )));
                    }
                    cmd = cmd.duration(*duration);
                }
                with_codecs(cmd, format)
            }

            Operation::ExtractAudio { format } => {
                let codec = format
                    .audio_codec
                    .clone()
                    .or_else(|| default_audio_codec(&format.container).map(String::from));
                let mut cmd = cmd.no_video();
                if let Some(codec) = codec {
                    cmd = cmd.audio_codec(codec);
                }
                if let Some(bitrate) = &format.audio_bitrate {
                    cmd = cmd.audio_bitrate(bitrate.clone());
                }
                cmd
            }

            Operation::TagMetadata { tags, .. } => {
                let mut cmd = cmd;
                for (key, value) in tags {
                    self.security.validate_tag_key(key)?;
                    if value.contains('\0') {
                        return Err(MediaError::invalid_request(format!(
                            "Metadata value for {} contains null bytes",
                            key
                        )));
                    }
                    cmd = cmd.metadata(key, value);
                }
                cmd.stream_copy()
            }
        };

        Ok(cmd.into_invocation(&self.ffmpeg, self.limits.clone()))
    }
}

fn with_codecs(mut cmd: FfmpegCommand, format: &TargetFormat) -> FfmpegCommand {
    if let Some(codec) = &format.video_codec {
        cmd = cmd.video_codec(codec.clone());
    }
    if let Some(codec) = &format.audio_codec {
        cmd = cmd.audio_codec(codec.clone());
    }
    if let Some(bitrate) = &format.audio_bitrate {
        cmd = cmd.audio_bitrate(bitrate.clone());
    }
    cmd
}

/// Audio encoder ffmpeg should use for an audio-only container.
pub fn default_audio_codec(container: &str) -> Option<&'static str> {
    match container.to_lowercase().as_str() {
        "mp3" => Some("libmp3lame"),
        "m4a" | "aac" => Some("aac"),
        "ogg" | "opus" => Some("libopus"),
        "flac" => Some("flac"),
        "wav" => Some("pcm_s16le"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mconv_models::JobId;
    use std::collections::BTreeMap;

    fn planner(dir: &Path) -> FfmpegPlanner {
        FfmpegPlanner::new("ffmpeg", dir).with_limits(ResourceLimits::unlimited())
    }

    fn source_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"not really media").unwrap();
        path
    }

    #[test]
    fn test_transcode_plan() {
        let dir = tempfile::tempdir().unwrap();
        let input = source_file(dir.path(), "clip.mkv");
        let job = Job::new(
            MediaSource::path(&input),
            Operation::Transcode {
                format: TargetFormat::container("mp4")
                    .with_video_codec("libx264")
                    .with_audio_codec("aac"),
            },
        );

        let invocation = planner(dir.path()).plan(&job).unwrap();
        let expected_output = dir.path().join(format!("clip_{}.mp4", job.id));

        assert_eq!(invocation.program, PathBuf::from("ffmpeg"));
        assert_eq!(invocation.output.as_deref(), Some(expected_output.as_path()));
        assert!(invocation.args.contains(&"libx264".to_string()));
        assert!(invocation.stdin.is_none());
    }

    #[test]
    fn test_label_names_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(
            MediaSource::bytes(vec![0u8; 16]),
            Operation::ExtractAudio {
                format: TargetFormat::container("mp3"),
            },
        )
        .with_label("Artist - Song: Remix");

        let invocation = planner(dir.path()).plan(&job).unwrap();
        let output = invocation.output.unwrap();
        let name = output.file_name().unwrap().to_string_lossy().to_string();

        assert!(name.starts_with("Artist - Song_ Remix_"));
        assert!(invocation.args.contains(&"pipe:0".to_string()));
        assert!(invocation.args.contains(&"-vn".to_string()));
        assert!(invocation.args.contains(&"libmp3lame".to_string()));
    }

    #[test]
    fn test_trim_rejects_negative_start() {
        let dir = tempfile::tempdir().unwrap();
        let input = source_file(dir.path(), "a.mp4");
        let job = Job::new(
            MediaSource::path(&input),
            Operation::Trim {
                start_secs: -1.0,
                duration_secs: None,
                format: TargetFormat::container("mp4"),
            },
        );

        let err = planner(dir.path()).plan(&job).unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn test_tag_metadata_copies_streams() {
        let dir = tempfile::tempdir().unwrap();
        let input = source_file(dir.path(), "song.mp3");
        let mut tags = BTreeMap::new();
        tags.insert("album".to_string(), "Song".to_string());
        tags.insert("track".to_string(), "01".to_string());
        let job = Job::new(
            MediaSource::path(&input),
            Operation::TagMetadata {
                tags,
                format: TargetFormat::container("mp3"),
            },
        );

        let args = planner(dir.path()).plan(&job).unwrap().args.join(" ");
        assert!(args.contains("-metadata album=Song -metadata track=01 -codec copy"));
    }

    #[test]
    fn test_rejects_unknown_container_and_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let input = source_file(dir.path(), "a.mp4");

        let bad_container = Job::new(
            MediaSource::path(&input),
            Operation::Transcode {
                format: TargetFormat::container("exe"),
            },
        );
        assert!(matches!(
            planner(dir.path()).plan(&bad_container),
            Err(MediaError::UnsupportedFormat(_))
        ));

        let missing = Job::new(
            MediaSource::path(dir.path().join("missing.mp4")),
            Operation::Transcode {
                format: TargetFormat::container("mp4"),
            },
        );
        assert!(matches!(
            planner(dir.path()).plan(&missing),
            Err(MediaError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_input_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(
            MediaSource::bytes(vec![0u8; 1024]),
            Operation::Transcode {
                format: TargetFormat::container("mp4"),
            },
        );
        let planner = FfmpegPlanner::new("ffmpeg", dir.path())
            .with_limits(ResourceLimits::unlimited().with_input_bytes(100));

        assert!(matches!(
            planner.plan(&job),
            Err(MediaError::ResourceLimit(_))
        ));
    }

    #[test]
    fn test_relative_output_dir_is_not_applied_twice() {
        let job = Job::new(
            MediaSource::bytes(vec![1u8]),
            Operation::Transcode {
                format: TargetFormat::container("mp4"),
            },
        );

        let invocation = FfmpegPlanner::new("ffmpeg", "downloads").plan(&job).unwrap();
        let expected = PathBuf::from("downloads").join(format!("output_{}.mp4", job.id));

        assert!(invocation.working_dir.is_none());
        assert_eq!(invocation.output.as_deref(), Some(expected.as_path()));
        assert_eq!(invocation.args.last(), Some(&expected.to_string_lossy().to_string()));
    }

    #[test]
    fn test_job_id_cannot_escape_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::new(
            MediaSource::bytes(vec![1u8]),
            Operation::Transcode {
                format: TargetFormat::container("mp4"),
            },
        );
        job.id = JobId::from_string("../a/b");

        let output = planner(dir.path()).plan(&job).unwrap().output.unwrap();
        assert_eq!(output.parent(), Some(dir.path()));
        assert_eq!(output.file_name().unwrap(), "output__a_b.mp4");
    }

    #[test]
    fn test_closure_planner() {
        let planner = |_: &Job| Ok(Invocation::new("true"));
        let job = Job::new(
            MediaSource::bytes(vec![1u8]),
            Operation::Transcode {
                format: TargetFormat::container("mp4"),
            },
        );
        assert_eq!(planner.plan(&job).unwrap().program, PathBuf::from("true"));
    }
}
