// # Instance HTTP Surface
//
// axum router for the inter-instance endpoints: chunked stream ingress,
// transfer progress, task status reports, queue intake, and health.

pub mod handlers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::cache::CacheService;
use crate::coordination::{ConsistentCache, InstanceCoordinator, StateSynchronizer};
use crate::queue::QueueService;
use crate::stream::StreamWorker;
use crate::tasks::{TaskDeduplicator, TaskManager};

/// Largest accepted request body. Chunk ingress carries raw file chunks, so
/// this sits well above the leader's chunk size but still bounds a runaway
/// client. axum's own 2 MB default is replaced by the explicit limit layer.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Per-request ceiling; a single chunk write never legitimately runs longer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handler state for one instance.
pub struct ApiState {
    pub queue: Arc<QueueService>,
    pub worker: Arc<StreamWorker>,
    pub manager: Arc<TaskManager>,
    pub dedup: Arc<TaskDeduplicator>,
    pub state_sync: Arc<StateSynchronizer>,
    pub consistent: Arc<ConsistentCache>,
    pub coordinator: Arc<InstanceCoordinator>,
    pub cache: Arc<CacheService>,
    pub started_at: Instant,
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v2/stream/{task_id}", post(handlers::stream_ingress))
        .route(
            "/api/v2/stream/{task_id}/progress",
            get(handlers::stream_progress),
        )
        .route(
            "/api/v2/tasks/{task_id}/status",
            post(handlers::task_status),
        )
        .route("/api/v2/tasks/{task_id}/retry", post(handlers::task_retry))
        .route("/api/tasks/{topic}", post(handlers::queue_intake))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
