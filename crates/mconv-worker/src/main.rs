//! Media conversion worker binary.
//!
//! Reads JSON job requests from stdin, one per line, and logs outcomes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mconv_media::{check_engine, FfmpegPlanner};
use mconv_queue::{JobQueue, QueueConfig};
use mconv_worker::health::{self, HealthState};
use mconv_worker::{metrics, JobRequest, LogHandler, ResultSink, WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing()?;
    info!("Starting mconv-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        metrics::install_prometheus(port)?;
        info!("Prometheus metrics on port {}", port);
    }

    match check_engine(&config.ffmpeg_path) {
        Ok(path) => info!("Using engine at {}", path.display()),
        Err(e) => warn!("{}; jobs will fail until it is installed", e),
    }

    let queue = Arc::new(JobQueue::new(QueueConfig::from_env()));
    let planner = Arc::new(
        FfmpegPlanner::new(&config.ffmpeg_path, &config.output_dir)
            .with_limits(config.limits.clone()),
    );
    let sink = Arc::new(ResultSink::new(
        Arc::new(LogHandler),
        config.delivery.clone(),
    ));

    let pool = WorkerPool::start(config.clone(), Arc::clone(&queue), planner, sink)
        .await
        .context("failed to start worker pool")?;

    let health_state = HealthState::new(Arc::clone(&queue));
    let health_port = config.health_port;
    let health_server = tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_state).await {
            error!("Health server error: {}", e);
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                interrupted = true;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => submit_line(&pool, &line),
                Ok(None) => {
                    info!("Input closed, waiting for queued jobs");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            }
        }
    }

    if !interrupted {
        // Let queued work finish unless interrupted meanwhile
        tokio::select! {
            _ = &mut shutdown => info!("Received shutdown signal"),
            _ = wait_idle(&pool) => {}
        }
    }

    let report = pool.shutdown().await;
    health_server.abort();

    info!(
        drained = report.drained,
        forced = report.forced,
        "Worker shutdown complete"
    );
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("mconv=info".parse()?);

    // Logs go to stderr; stdin carries requests
    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

fn submit_line(pool: &WorkerPool, line: &str) {
    let request = match JobRequest::parse_line(line) {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            warn!("Ignoring malformed request: {}", e);
            return;
        }
    };

    match pool.submit(request.into_job()) {
        Ok(job_id) => info!(job_id = %job_id, "Job accepted"),
        Err(e) if e.is_backpressure() => warn!("Busy, request rejected: {}", e),
        Err(e) => warn!("Request rejected: {}", e),
    }
}

async fn wait_idle(pool: &WorkerPool) {
    while pool.pending_jobs() > 0 || pool.active_jobs() > 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
