//! Worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mconv_media::ResourceLimits;

use crate::sink::DeliveryConfig;

const MB: u64 = 1024 * 1024;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of executors; each may run one engine process
    pub max_concurrent_jobs: usize,
    /// Per-invocation timeout
    pub job_timeout: Duration,
    /// How long shutdown waits for running jobs before cancelling them
    pub shutdown_timeout: Duration,
    /// Directory artifacts are written to
    pub output_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Read the artifact's duration with ffprobe after a successful run
    pub probe_output: bool,
    pub limits: ResourceLimits,
    pub delivery: DeliveryConfig,
    pub health_port: u16,
    /// Prometheus exporter port; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_concurrency(),
            job_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
            output_dir: PathBuf::from("downloads"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            probe_output: true,
            limits: ResourceLimits::default(),
            delivery: DeliveryConfig::default(),
            health_port: 8000,
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    ///
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_limits = &defaults.limits;
        let default_delivery = &defaults.delivery;

        let limits = ResourceLimits {
            cpu_time: env_parse::<u64>("LIMIT_CPU_SECS")
                .map(Duration::from_secs)
                .or(default_limits.cpu_time),
            memory_bytes: env_parse::<u64>("LIMIT_MEMORY_MB")
                .map(|mb| mb.saturating_mul(MB))
                .or(default_limits.memory_bytes),
            output_bytes: env_parse::<u64>("LIMIT_OUTPUT_MB")
                .map(|mb| mb.saturating_mul(MB))
                .or(default_limits.output_bytes),
            input_bytes: env_parse::<u64>("LIMIT_INPUT_MB")
                .map(|mb| mb.saturating_mul(MB))
                .or(default_limits.input_bytes),
            diagnostics_bytes: env_parse::<usize>("LIMIT_DIAGNOSTICS_KB")
                .map(|kb| kb.saturating_mul(1024))
                .unwrap_or(default_limits.diagnostics_bytes),
        };

        let delivery = DeliveryConfig {
            max_attempts: env_parse("DELIVERY_MAX_ATTEMPTS").unwrap_or(default_delivery.max_attempts),
            base_delay: env_parse("DELIVERY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(default_delivery.base_delay),
            max_delay: env_parse("DELIVERY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(default_delivery.max_delay),
            dedup_capacity: default_delivery.dedup_capacity,
        };

        Self {
            max_concurrent_jobs: env_parse::<usize>("WORKER_MAX_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            job_timeout: env_parse("WORKER_JOB_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            output_dir: std::env::var("WORKER_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            ffmpeg_path: std::env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: std::env::var("FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe_path),
            probe_output: std::env::var("WORKER_PROBE_OUTPUT")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(defaults.probe_output),
            limits,
            delivery,
            health_port: env_parse("HEALTH_PORT").unwrap_or(defaults.health_port),
            metrics_port: env_parse("METRICS_PORT"),
        }
    }
}

/// Two executors, or fewer on machines with fewer cores.
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(2)
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!((1..=2).contains(&config.max_concurrent_jobs));
        assert_eq!(config.job_timeout, Duration::from_secs(600));
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.limits.output_bytes, Some(2048 * MB));
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
