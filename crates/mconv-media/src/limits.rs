//! Resource limits enforced on engine processes.
//!
//! Limits are applied by the runner with `setrlimit` in the child between
//! fork and exec, so an untrusted input cannot make the engine consume more
//! than its share regardless of the engine's own defaults.

use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Per-invocation resource caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time (RLIMIT_CPU). The kernel sends SIGXCPU at the soft limit.
    pub cpu_time: Option<Duration>,
    /// Address space (RLIMIT_AS)
    pub memory_bytes: Option<u64>,
    /// Largest file the engine may write (RLIMIT_FSIZE), re-checked on the artifact
    pub output_bytes: Option<u64>,
    /// Largest source file the planner accepts
    pub input_bytes: Option<u64>,
    /// How much of stdout/stderr is kept (tail)
    pub diagnostics_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: Some(Duration::from_secs(600)),
            memory_bytes: Some(2048 * MB),
            output_bytes: Some(2048 * MB),
            input_bytes: Some(2048 * MB),
            diagnostics_bytes: 64 * 1024,
        }
    }
}

impl ResourceLimits {
    /// No kernel limits; diagnostics still bounded.
    pub fn unlimited() -> Self {
        Self {
            cpu_time: None,
            memory_bytes: None,
            output_bytes: None,
            input_bytes: None,
            diagnostics_bytes: 64 * 1024,
        }
    }

    pub fn with_cpu_time(mut self, cpu_time: Duration) -> Self {
        self.cpu_time = Some(cpu_time);
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_bytes = Some(mb * MB);
        self
    }

    pub fn with_output_bytes(mut self, bytes: u64) -> Self {
        self.output_bytes = Some(bytes);
        self
    }

    pub fn with_input_bytes(mut self, bytes: u64) -> Self {
        self.input_bytes = Some(bytes);
        self
    }

    pub fn with_diagnostics_bytes(mut self, bytes: usize) -> Self {
        self.diagnostics_bytes = bytes;
        self
    }

    /// Whether any kernel-enforced limit is set.
    pub fn has_process_limits(&self) -> bool {
        self.cpu_time.is_some() || self.memory_bytes.is_some() || self.output_bytes.is_some()
    }

    /// Apply the limits to the calling process.
    ///
    /// Runs inside `pre_exec`, so it must stay async-signal-safe: plain
    /// syscalls only, no allocation.
    #[cfg(target_os = "linux")]
    pub fn apply_to_current_process(&self) -> std::io::Result<()> {
        use nix::sys::resource::{setrlimit, Resource};

        if let Some(cpu) = self.cpu_time {
            let soft = cpu.as_secs().max(1);
            // Hard limit a little above soft so SIGXCPU arrives before SIGKILL
            setrlimit(Resource::RLIMIT_CPU, soft, soft + 5)?;
        }
        if let Some(bytes) = self.memory_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(bytes) = self.output_bytes {
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply_to_current_process(&self) -> std::io::Result<()> {
        Ok(())
    }
}
