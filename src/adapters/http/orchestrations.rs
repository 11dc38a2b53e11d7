//! Orchestration endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::models::orchestration::validate_items;
use crate::domain::models::{
    ClaudeModel, NewTask, Orchestration, OrchestrationItem, OrchestrationStatus,
};
use crate::services::validate_graph;

use super::{bad_request, internal, not_found, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct TaskItemRequest {
    pub identifier: String,
    pub execution_prompt: String,
    pub working_directory: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub initial_delay: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrchestrationRequest {
    pub tasks: Vec<TaskItemRequest>,
}

#[derive(Debug, Serialize)]
pub struct OrchestrationTaskRef {
    pub identifier: String,
    pub task_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrchestrationResponse {
    pub orchestration_id: i64,
    pub status: String,
    pub total_tasks: i64,
    pub tasks: Vec<OrchestrationTaskRef>,
}

#[derive(Debug, Serialize)]
pub struct OrchestrationTaskSummary {
    pub task_id: i64,
    pub identifier: Option<String>,
    pub status: String,
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrchestrationView {
    pub orchestration_id: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<OrchestrationTaskSummary>,
}

impl OrchestrationView {
    fn from_row(orch: Orchestration, tasks: Vec<OrchestrationTaskSummary>) -> Self {
        Self {
            orchestration_id: orch.id,
            status: orch.status.as_str().to_string(),
            created_at: orch.created_at,
            started_at: orch.started_at,
            ended_at: orch.ended_at,
            total_tasks: orch.total_tasks,
            completed_tasks: orch.completed_tasks,
            failed_tasks: orch.failed_tasks,
            skipped_tasks: orch.skipped_tasks,
            tasks,
        }
    }
}

/// Create an orchestration: validate the items, persist every child task
/// in WAITING, validate the graph synchronously, then start the
/// orchestrator worker. An invalid graph leaves the orchestration stored
/// as `failed` with every child task skipped, and returns 400.
pub async fn create_orchestration(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateOrchestrationRequest>,
) -> Result<Json<CreateOrchestrationResponse>, ApiError> {
    let mut items = Vec::with_capacity(request.tasks.len());
    for task in &request.tasks {
        let model = match task.model.as_deref() {
            None => None,
            Some(raw) => Some(
                ClaudeModel::from_str(raw)
                    .ok_or_else(|| bad_request(format!("Unknown model '{raw}'")))?,
            ),
        };
        items.push(OrchestrationItem {
            identifier: task.identifier.clone(),
            execution_prompt: task.execution_prompt.clone(),
            working_directory: task.working_directory.clone(),
            system_prompt: task.system_prompt.clone(),
            model,
            depends_on: task.depends_on.clone(),
            initial_delay: task.initial_delay,
        });
    }
    validate_items(&items).map_err(bad_request)?;

    let orch = state
        .orchestrations
        .create(items.len() as i64)
        .await
        .map_err(|e| internal(e.to_string()))?;

    // Persist every child in WAITING with its DAG metadata.
    let mut task_refs = Vec::with_capacity(items.len());
    for item in &items {
        let input = NewTask::validate(
            &item.execution_prompt,
            &item.working_directory,
            item.system_prompt.as_deref(),
            item.model,
        )
        .map_err(bad_request)?;
        let task = state
            .tasks
            .create_task(&input, &state.task_log_dir)
            .await
            .map_err(|e| internal(e.to_string()))?;
        state
            .tasks
            .attach_to_orchestration(
                task.id,
                orch.id,
                &item.identifier,
                item.depends_on.as_deref(),
                item.initial_delay,
            )
            .await
            .map_err(|e| internal(e.to_string()))?;
        task_refs.push(OrchestrationTaskRef {
            identifier: item.identifier.clone(),
            task_id: task.id,
            depends_on: item.depends_on.clone(),
            initial_delay: item.initial_delay,
        });
    }

    // Synchronous graph validation: reference integrity and acyclicity.
    let graph: HashMap<String, Vec<String>> = items
        .iter()
        .map(|item| {
            (
                item.identifier.clone(),
                item.depends_on.clone().unwrap_or_default(),
            )
        })
        .collect();
    if let Err(e) = validate_graph(&graph) {
        for task_ref in &task_refs {
            let _ = state
                .tasks
                .mark_skipped(task_ref.task_id, &format!("Orchestration rejected: {e}"))
                .await;
        }
        let _ = state
            .orchestrations
            .update_status(orch.id, OrchestrationStatus::Failed)
            .await;
        return Err(bad_request(e.to_string()));
    }

    let orchestrator = state.orchestrator.clone();
    let orchestration_id = orch.id;
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run(orchestration_id).await {
            tracing::error!(orchestration_id, error = %e, "orchestration failed");
        }
    });

    tracing::info!(
        orchestration_id = orch.id,
        total_tasks = items.len(),
        "created orchestration"
    );
    Ok(Json(CreateOrchestrationResponse {
        orchestration_id: orch.id,
        status: OrchestrationStatus::Pending.as_str().to_string(),
        total_tasks: items.len() as i64,
        tasks: task_refs,
    }))
}

pub async fn get_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OrchestrationView>, ApiError> {
    let orch = state
        .orchestrations
        .get(id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found("Orchestration not found"))?;

    let tasks = state
        .tasks
        .get_tasks_by_orchestration(id)
        .await
        .map_err(|e| internal(e.to_string()))?;
    let summaries = tasks
        .into_iter()
        .map(|task| OrchestrationTaskSummary {
            task_id: task.id,
            identifier: task.identifier.clone(),
            status: task.status.as_str().to_string(),
            depends_on: task.dependencies().to_vec(),
            initial_delay: task.initial_delay,
            started_at: task.started_at,
            ended_at: task.ended_at,
            error_message: task.error_message,
        })
        .collect();

    Ok(Json(OrchestrationView::from_row(orch, summaries)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list_orchestrations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<OrchestrationView>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            OrchestrationStatus::from_str(raw)
                .ok_or_else(|| bad_request(format!("Unknown status '{raw}'")))?,
        ),
    };

    let orchestrations = state
        .orchestrations
        .list(status, query.limit)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(
        orchestrations
            .into_iter()
            .map(|orch| OrchestrationView::from_row(orch, Vec::new()))
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub orchestration_id: i64,
    pub cancelled_count: usize,
}

/// Cancel an orchestration: WAITING/PENDING children become SKIPPED;
/// RUNNING children are left to finish naturally.
pub async fn cancel_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CancelResponse>, ApiError> {
    let orch = state
        .orchestrations
        .get(id)
        .await
        .map_err(|e| internal(e.to_string()))?
        .ok_or_else(|| not_found("Orchestration not found"))?;

    if !orch.status.can_cancel() {
        return Err(bad_request(format!(
            "Cannot cancel orchestration in {} state",
            orch.status.as_str()
        )));
    }

    let tasks = state
        .tasks
        .get_tasks_by_orchestration(id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let mut cancelled = 0;
    for task in tasks {
        if matches!(
            task.status,
            crate::domain::models::TaskStatus::Waiting | crate::domain::models::TaskStatus::Pending
        ) {
            state
                .tasks
                .mark_skipped(task.id, "Cancelled by user")
                .await
                .map_err(|e| internal(e.to_string()))?;
            cancelled += 1;
        }
    }

    state
        .orchestrations
        .update_status(id, OrchestrationStatus::Cancelled)
        .await
        .map_err(|e| internal(e.to_string()))?;

    tracing::info!(orchestration_id = id, cancelled, "cancelled orchestration");
    Ok(Json(CancelResponse {
        orchestration_id: id,
        cancelled_count: cancelled,
    }))
}
