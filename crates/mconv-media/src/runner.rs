//! Engine process runner.
//!
//! Every invocation runs in its own process group. The group is killed and
//! the child reaped on timeout, cancellation and internal error; a drop guard
//! plus `kill_on_drop` cover the case where the run future itself is dropped.
//! A failed run also removes whatever it wrote to the declared output.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Invocation;
use crate::error::{MediaError, MediaResult};

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// OS process id of the engine (already reaped)
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    /// Artifact path, if the invocation declared one
    pub output: Option<PathBuf>,
    pub output_bytes: Option<u64>,
    /// Captured stdout tail
    pub stdout: Vec<u8>,
    /// Captured stderr tail
    pub diagnostics: String,
}

/// Runner for engine invocations with timeout, cancellation and teardown.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// How long to wait for a killed child to be reaped, and for its output
    /// pipes to close after a normal exit
    reap_timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self {
            reap_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_reap_timeout(mut self, reap_timeout: Duration) -> Self {
        self.reap_timeout = reap_timeout;
        self
    }

    /// Run an invocation to completion or until `timeout` elapses.
    pub async fn run(&self, invocation: Invocation, timeout: Duration) -> MediaResult<RunReport> {
        self.execute(invocation, timeout, None).await
    }

    /// Run an invocation that can be cancelled by sending `true` on `cancel`.
    pub async fn run_cancellable(
        &self,
        invocation: Invocation,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<RunReport> {
        self.execute(invocation, timeout, Some(cancel)).await
    }

    async fn execute(
        &self,
        invocation: Invocation,
        timeout: Duration,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<RunReport> {
        let started = Instant::now();

        if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(MediaError::Cancelled);
        }

        let Invocation {
            program,
            args,
            working_dir,
            stdin,
            output,
            limits,
        } = invocation;

        debug!("Running engine: {} {}", program.display(), args.join(" "));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            command.process_group(0);
            if limits.has_process_limits() {
                let child_limits = limits.clone();
                // SAFETY: the hook only issues setrlimit syscalls, which are
                // async-signal-safe and touch no shared state.
                unsafe {
                    command.pre_exec(move || child_limits.apply_to_current_process());
                }
            }
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MediaError::EngineNotFound(program.display().to_string())
            }
            _ => MediaError::Io(e),
        })?;

        let pid = child.id();
        let mut guard = ProcessGuard::new(pid);
        info!(pid = ?pid, "Engine started: {}", program.display());

        let stdin_task = match (child.stdin.take(), stdin) {
            (Some(mut pipe), Some(data)) => Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    // The engine may stop reading early; its exit status decides
                    debug!("Engine stdin closed early: {}", e);
                }
                let _ = pipe.shutdown().await;
            })),
            _ => None,
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture_tail(out, limits.diagnostics_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(capture_tail(err, limits.diagnostics_bytes)));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancellation(&mut cancel) => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(Ok(status)) => status,
            Waited::Exited(Err(e)) => {
                self.terminate(&mut child, &mut guard).await;
                abort_io(stdin_task, stdout_task, stderr_task);
                discard_output(output.as_deref()).await;
                return Err(MediaError::Io(e));
            }
            Waited::TimedOut => {
                warn!(pid = ?pid, "Engine timed out after {:?}, killing process group", timeout);
                self.terminate(&mut child, &mut guard).await;
                abort_io(stdin_task, stdout_task, stderr_task);
                discard_output(output.as_deref()).await;
                return Err(MediaError::TimedOut(timeout));
            }
            Waited::Cancelled => {
                info!(pid = ?pid, "Engine cancelled, killing process group");
                self.terminate(&mut child, &mut guard).await;
                abort_io(stdin_task, stdout_task, stderr_task);
                discard_output(output.as_deref()).await;
                return Err(MediaError::Cancelled);
            }
        };

        // Leader is reaped; sweep anything it left behind in its group so the
        // pipes close and nothing outlives the invocation.
        guard.kill();
        guard.disarm();

        if let Some(task) = stdin_task {
            task.abort();
        }
        // A descendant that left the group can still hold the pipes open
        let stdout = join_capture(stdout_task, self.reap_timeout).await;
        let stderr = join_capture(stderr_task, self.reap_timeout).await;
        let diagnostics = if stderr.is_empty() {
            String::from_utf8_lossy(&stdout).to_string()
        } else {
            String::from_utf8_lossy(&stderr).to_string()
        };

        if !status.success() {
            discard_output(output.as_deref()).await;
            if let Some(limit) = exceeded_limit(&status) {
                return Err(MediaError::ResourceLimit(limit.to_string()));
            }
            return Err(MediaError::processing_failed(
                format!("engine exited with {}", status),
                diagnostics,
                status.code(),
            ));
        }

        let output_bytes = match &output {
            Some(path) => {
                let metadata = tokio::fs::metadata(path).await.map_err(|_| {
                    MediaError::processing_failed(
                        format!("engine produced no output at {}", path.display()),
                        diagnostics.clone(),
                        status.code(),
                    )
                })?;

                if let Some(limit) = limits.output_bytes {
                    if metadata.len() > limit {
                        discard_output(Some(path.as_path())).await;
                        return Err(MediaError::ResourceLimit(format!(
                            "output size {} bytes exceeds maximum {} bytes",
                            metadata.len(),
                            limit
                        )));
                    }
                }
                Some(metadata.len())
            }
            None => None,
        };

        let elapsed = started.elapsed();
        debug!(pid = ?pid, "Engine finished in {:?}", elapsed);

        Ok(RunReport {
            pid,
            exit_code: status.code(),
            elapsed,
            output,
            output_bytes,
            stdout,
            diagnostics,
        })
    }

    /// Kill the process group and reap the child.
    async fn terminate(&self, child: &mut Child, guard: &mut ProcessGuard) {
        guard.kill();
        let _ = child.start_kill();

        match tokio::time::timeout(self.reap_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Engine reaped after kill: {}", status);
                guard.disarm();
            }
            Ok(Err(e)) => warn!("Failed to reap engine process: {}", e),
            Err(_) => warn!("Engine not reaped within {:?}", self.reap_timeout),
        }
    }
}

/// Kills the engine's process group when dropped while armed.
struct ProcessGuard {
    pgid: Option<i32>,
    armed: bool,
}

impl ProcessGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|p| p as i32),
            armed: true,
        }
    }

    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            // ESRCH just means the group is already gone
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}

/// Resolves once `cancel` reads `true`. Never resolves without a receiver.
async fn cancellation(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel else {
        return std::future::pending().await;
    };

    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without cancelling
            return std::future::pending().await;
        }
    }
}

/// Read a stream to EOF, keeping only the last `limit` bytes.
async fn capture_tail<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit {
                    let excess = kept.len() - limit;
                    kept.drain(..excess);
                }
            }
        }
    }

    kept
}

/// Collect a capture task, giving up after `limit`.
async fn join_capture(task: Option<JoinHandle<Vec<u8>>>, limit: Duration) -> Vec<u8> {
    let Some(mut handle) = task else {
        return Vec::new();
    };

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            warn!("Engine output still open {:?} after exit, dropping capture", limit);
            handle.abort();
            Vec::new()
        }
    }
}

/// Best-effort removal of a partial or rejected artifact.
async fn discard_output(path: Option<&Path>) {
    let Some(path) = path else { return };
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

fn abort_io(
    stdin: Option<JoinHandle<()>>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
) {
    if let Some(task) = stdin {
        task.abort();
    }
    for task in [stdout, stderr].into_iter().flatten() {
        task.abort();
    }
}

/// Map a kernel limit signal to a description.
#[cfg(unix)]
fn exceeded_limit(status: &ExitStatus) -> Option<&'static str> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    match status.signal().map(Signal::try_from) {
        Some(Ok(Signal::SIGXCPU)) => Some("CPU time limit"),
        Some(Ok(Signal::SIGXFSZ)) => Some("output size limit"),
        _ => None,
    }
}

#[cfg(not(unix))]
fn exceeded_limit(_status: &ExitStatus) -> Option<&'static str> {
    None
}

/// Check that an engine binary is available.
pub fn check_engine(program: impl AsRef<std::ffi::OsStr>) -> MediaResult<PathBuf> {
    let program = program.as_ref();
    which::which(program)
        .map_err(|_| MediaError::EngineNotFound(program.to_string_lossy().to_string()))
}
