//! FFmpeg command builder and the invocation it produces.

use std::path::{Path, PathBuf};

use crate::limits::ResourceLimits;

/// A concrete engine execution: program, arguments and everything the runner
/// needs to supervise it. Consumed by a single run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program to execute (name on PATH or absolute path)
    pub program: PathBuf,
    /// Arguments, passed verbatim (no shell involved)
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Bytes written to the process's stdin, then closed
    pub stdin: Option<Vec<u8>>,
    /// File the engine is expected to produce
    pub output: Option<PathBuf>,
    /// Kernel and capture limits
    pub limits: ResourceLimits,
}

impl Invocation {
    /// Create a new invocation with default limits.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            stdin: None,
            output: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Command line as a single string, for logging.
    pub fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Where the engine reads its input from.
#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Pipe(Vec<u8>),
}

impl Source {
    fn as_arg(&self) -> String {
        match self {
            Source::File(path) => path.to_string_lossy().into_owned(),
            Source::Pipe(_) => "pipe:0".to_string(),
        }
    }
}

/// Argument list for one ffmpeg run.
///
/// Flags are split around `-i`: seeking and duration apply to the input,
/// codecs and tags to the output. The result always overwrites and only
/// logs errors.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    source: Source,
    destination: PathBuf,
    pre_input: Vec<String>,
    post_input: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self::reading(Source::File(input.as_ref().to_path_buf()), output)
    }

    /// Feed `data` to the engine through stdin.
    pub fn from_bytes(data: impl Into<Vec<u8>>, output: impl AsRef<Path>) -> Self {
        Self::reading(Source::Pipe(data.into()), output)
    }

    fn reading(source: Source, output: impl AsRef<Path>) -> Self {
        Self {
            source,
            destination: output.as_ref().to_path_buf(),
            pre_input: Vec::new(),
            post_input: Vec::new(),
        }
    }

    fn before_input(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.pre_input.push(flag.to_string());
        self.pre_input.push(value.into());
        self
    }

    fn after_input(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.post_input.push(flag.to_string());
        self.post_input.push(value.into());
        self
    }

    /// Start reading at `seconds` into the input.
    pub fn seek(self, seconds: f64) -> Self {
        self.before_input("-ss", format!("{seconds:.3}"))
    }

    /// Read at most `seconds` of input.
    pub fn duration(self, seconds: f64) -> Self {
        self.before_input("-t", format!("{seconds:.3}"))
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.after_input("-c:v", codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.after_input("-c:a", codec)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.after_input("-b:a", bitrate)
    }

    pub fn no_video(mut self) -> Self {
        self.post_input.push("-vn".to_string());
        self
    }

    /// Copy every stream untouched.
    pub fn stream_copy(self) -> Self {
        self.after_input("-codec", "copy")
    }

    pub fn metadata(self, key: &str, value: &str) -> Self {
        self.after_input("-metadata", format!("{key}={value}"))
    }

    pub fn output_path(&self) -> &Path {
        &self.destination
    }

    /// Full argument vector, program name excluded.
    pub fn to_args(&self) -> Vec<String> {
        ["-y", "-v", "error"]
            .into_iter()
            .map(String::from)
            .chain(self.pre_input.iter().cloned())
            .chain(["-i".to_string(), self.source.as_arg()])
            .chain(self.post_input.iter().cloned())
            .chain([self.destination.to_string_lossy().into_owned()])
            .collect()
    }

    pub fn into_invocation(self, program: impl Into<PathBuf>, limits: ResourceLimits) -> Invocation {
        let invocation = Invocation::new(program)
            .args(self.to_args())
            .output(self.destination)
            .limits(limits);

        match self.source {
            Source::Pipe(data) => invocation.stdin(data),
            Source::File(_) => invocation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], flag: &str) -> usize {
        args.iter().position(|a| a == flag).unwrap()
    }

    #[test]
    fn test_input_flags_precede_input() {
        let args = FfmpegCommand::new("clip.mkv", "clip.webm")
            .seek(2.5)
            .duration(12.0)
            .video_codec("libvpx-vp9")
            .to_args();

        assert_eq!(&args[..3], ["-y", "-v", "error"]);
        assert_eq!(args[position(&args, "-ss") + 1], "2.500");
        assert_eq!(args[position(&args, "-t") + 1], "12.000");
        assert!(position(&args, "-ss") < position(&args, "-i"));
        assert!(position(&args, "-c:v") > position(&args, "-i"));
        assert_eq!(args.last().unwrap(), "clip.webm");
    }

    #[test]
    fn test_piped_input() {
        let invocation = FfmpegCommand::from_bytes(vec![1, 2, 3], "/out/a.mp3")
            .no_video()
            .into_invocation("ffmpeg", ResourceLimits::unlimited());

        assert_eq!(invocation.args[position(&invocation.args, "-i") + 1], "pipe:0");
        assert_eq!(invocation.stdin.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(invocation.output.as_deref(), Some(Path::new("/out/a.mp3")));
    }

    #[test]
    fn test_tags_then_copy() {
        let joined = FfmpegCommand::new("in.mp3", "out.mp3")
            .metadata("album", "Title")
            .metadata("track", "01")
            .stream_copy()
            .to_args()
            .join(" ");

        assert!(joined.contains("-metadata album=Title -metadata track=01 -codec copy"));
    }
}
