//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn install_prometheus(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    pub const QUEUE_LENGTH: &str = "mconv_queue_length";
    pub const ACTIVE_JOBS: &str = "mconv_active_jobs";
    pub const JOBS_ENQUEUED_TOTAL: &str = "mconv_jobs_enqueued_total";
    pub const JOBS_REJECTED_TOTAL: &str = "mconv_jobs_rejected_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "mconv_jobs_completed_total";

    pub const ENGINE_DURATION_SECONDS: &str = "mconv_engine_duration_seconds";

    pub const DELIVERIES_TOTAL: &str = "mconv_deliveries_total";
    pub const DELIVERIES_ABANDONED_TOTAL: &str = "mconv_deliveries_abandoned_total";
}

pub fn set_queue_length(length: usize) {
    gauge!(names::QUEUE_LENGTH).set(length as f64);
}

pub fn set_active_jobs(count: usize) {
    gauge!(names::ACTIVE_JOBS).set(count as f64);
}

pub fn record_job_enqueued(operation: &str) {
    let labels = [("operation", operation.to_string())];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
}

/// Record a submission turned away by the queue.
pub fn record_job_rejected(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::JOBS_REJECTED_TOTAL, &labels).increment(1);
}

pub fn record_job_completed(status: &str) {
    let labels = [("status", status.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
}

pub fn record_engine_duration(operation: &str, duration_secs: f64) {
    let labels = [("operation", operation.to_string())];
    histogram!(names::ENGINE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_delivery(attempts: u32) {
    let labels = [("attempts", attempts.to_string())];
    counter!(names::DELIVERIES_TOTAL, &labels).increment(1);
}

pub fn record_delivery_abandoned() {
    counter!(names::DELIVERIES_ABANDONED_TOTAL).increment(1);
}
