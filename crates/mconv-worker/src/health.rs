//! Health check server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use mconv_queue::JobQueue;
use serde::Serialize;
use tracing::info;

use crate::error::WorkerResult;

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub queue_depth: usize,
    pub active_jobs: usize,
}

#[derive(Clone)]
pub struct HealthState {
    queue: Arc<JobQueue>,
}

impl HealthState {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}

/// Liveness probe used by container platforms.
pub async fn root() -> &'static str {
    "OK"
}

pub async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let status = if state.queue.is_closed() {
        "shutting_down"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        queue_depth: state.queue.len(),
        active_jobs: state.queue.active_len(),
    })
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the health routes on `port` until the task is aborted.
pub async fn serve(port: u16, state: HealthState) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use mconv_models::{Job, MediaSource, Operation, TargetFormat};
    use mconv_queue::QueueConfig;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new(QueueConfig::new(4)));
        (router(HealthState::new(Arc::clone(&queue))), queue)
    }

    #[tokio::test]
    async fn test_root_answers_ok() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_health_reports_queue_depth() {
        let (app, queue) = app();
        queue
            .enqueue(Job::new(
                MediaSource::bytes(vec![0u8]),
                Operation::Transcode {
                    format: TargetFormat::container("mp4"),
                },
            ))
            .unwrap();

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["queue_depth"], 1);
        assert_eq!(json["active_jobs"], 0);
    }
}
