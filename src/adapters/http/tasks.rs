//! Task endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::errors::DomainError;
use crate::domain::models::{ClaudeModel, NewTask, Task};
use crate::services::check_admission;

use super::{bad_request, internal, not_found, ApiError, AppState};

/// Public-facing task representation.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: i64,
    pub status: String,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action_cache: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            status: task.status.as_str().to_string(),
            working_directory: task.working_directory,
            created_at: task.created_at,
            started_at: task.started_at,
            ended_at: task.ended_at,
            last_action_cache: task.last_action_cache,
            final_summary: task.final_summary,
            error_message: task.error_message,
        }
    }
}

/// Lenient human-facing request body.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub execution_prompt: String,
    pub working_directory: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Strict machine-facing request body.
#[derive(Debug, Deserialize)]
pub struct CreateMcpTaskRequest {
    pub system_prompt: String,
    pub execution_prompt: String,
    pub working_directory: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn parse_model(raw: Option<&str>) -> Result<Option<ClaudeModel>, ApiError> {
    match raw {
        None => Ok(None),
        Some(raw) => ClaudeModel::from_str(raw)
            .map(Some)
            .ok_or_else(|| bad_request(format!("Unknown model '{raw}'"))),
    }
}

/// Persist a validated task and schedule its runner.
///
/// Scheduling happens on the server's own event loop rather than a worker
/// pool: the agent runtime binds credentials to the invoking process.
/// The isolated-runner mode hands off to a detached subprocess instead.
pub(super) async fn schedule_task(
    state: &Arc<AppState>,
    input: NewTask,
) -> Result<Task, ApiError> {
    check_admission(&state.tasks, state.config.task.max_concurrent_tasks)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let task = state
        .tasks
        .create_task(&input, &state.task_log_dir)
        .await
        .map_err(|e| internal(format!("Failed to create task: {e}")))?;

    spawn_runner(state, task.id).await?;
    Ok(task)
}

pub(super) async fn spawn_runner(state: &Arc<AppState>, task_id: i64) -> Result<(), ApiError> {
    if let Some(isolated) = &state.isolated {
        isolated
            .spawn(task_id, &state.config.task)
            .await
            .map_err(|e| match e {
                DomainError::AdmissionRefused { .. } => internal(e.to_string()),
                other => internal(format!("Failed to start isolated runner: {other}")),
            })?;
    } else {
        let runner = state.runner.clone();
        tokio::spawn(async move { runner.run(task_id).await });
    }
    Ok(())
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskView>, ApiError> {
    let model = parse_model(request.model.as_deref())?;
    let input = NewTask::validate(
        &request.execution_prompt,
        &request.working_directory,
        request.system_prompt.as_deref(),
        model,
    )
    .map_err(bad_request)?;

    let task = schedule_task(&state, input).await?;
    tracing::info!(task_id = task.id, model = task.model.as_str(), "created task");
    Ok(Json(TaskView::from(task)))
}

pub async fn create_mcp_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMcpTaskRequest>,
) -> Result<Json<TaskView>, ApiError> {
    let model = parse_model(request.model.as_deref())?;
    let input = NewTask::validate_strict(
        &request.execution_prompt,
        &request.working_directory,
        &request.system_prompt,
        model,
    )
    .map_err(bad_request)?;

    let task = schedule_task(&state, input).await?;
    tracing::info!(task_id = task.id, "created task via MCP endpoint");
    Ok(Json(TaskView::from(task)))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskView>, ApiError> {
    let task = state
        .tasks
        .get_task(id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found("Task not found"))?;
    Ok(Json(TaskView::from(task)))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let tasks = state
        .tasks
        .list_tasks(None, None)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub deleted: u64,
}

pub async fn clear_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClearResponse>, ApiError> {
    let deleted = state
        .tasks
        .clear_completed_tasks()
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(ClearResponse { deleted }))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<DeleteResponse>), ApiError> {
    match state.tasks.delete_task(id).await {
        Ok(true) => Ok((StatusCode::OK, Json(DeleteResponse { deleted: true }))),
        Ok(false) => Err(not_found("Task not found")),
        Err(DomainError::ValidationFailed(message)) => Err(bad_request(message)),
        Err(e) => Err(internal(e.to_string())),
    }
}
