//! HTTP API: thin axum layer over the stores and workers.

pub mod orchestrations;
pub mod tasks;

use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::adapters::sqlite::{SqliteOrchestrationStore, SqliteTaskStore};
use crate::domain::models::Config;
use crate::infrastructure::process::IsolatedRunner;
use crate::services::{Orchestrator, TaskRunner};

/// Shared state for all handlers.
pub struct AppState {
    pub tasks: SqliteTaskStore,
    pub orchestrations: SqliteOrchestrationStore,
    pub runner: TaskRunner,
    pub orchestrator: Orchestrator,
    pub config: Config,
    /// Directory for per-task summary logs.
    pub task_log_dir: PathBuf,
    /// Present when the isolated-runner deployment mode is enabled.
    pub isolated: Option<Arc<IsolatedRunner>>,
}

/// Error payload shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            code: "VALIDATION_ERROR".to_string(),
        }),
    )
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

pub fn internal(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
            code: "INTERNAL_ERROR".to_string(),
        }),
    )
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/tasks", post(tasks::create_task))
        .route("/api/v1/tasks", get(tasks::list_tasks))
        .route("/api/v1/mcp/tasks", post(tasks::create_mcp_task))
        .route("/api/v1/tasks/clear", post(tasks::clear_tasks))
        .route("/api/v1/tasks/{id}", get(tasks::get_task))
        .route("/api/v1/tasks/{id}", delete(tasks::delete_task))
        .route("/api/v1/orchestrations", post(orchestrations::create_orchestration))
        .route("/api/v1/orchestrations", get(orchestrations::list_orchestrations))
        .route("/api/v1/orchestrations/{id}", get(orchestrations::get_orchestration))
        .route(
            "/api/v1/orchestrations/{id}/cancel",
            delete(orchestrations::cancel_orchestration),
        )
        .route("/health", get(health))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "claude-cto",
    }))
}

/// Serve until the shutdown future resolves.
pub async fn serve<F>(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);
    tracing::info!(%addr, "server listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
