//! API surface: validation rules, strict MCP variant, cycle rejection,
//! list/clear/delete endpoints, and health.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use claude_cto::domain::models::TaskStatus;
use common::{request, test_server, wait_for_terminal};

#[tokio::test]
async fn health_reports_service() {
    let server = test_server().await;
    let (status, body) = request(&server.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "claude-cto");
}

#[tokio::test]
async fn task_validation_rules() {
    let server = test_server().await;

    // Prompt too short.
    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"execution_prompt": "short", "working_directory": "/tmp"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("10 characters"));

    // Empty working directory.
    let (status, _) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"execution_prompt": "long enough prompt", "working_directory": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown model.
    let (status, _) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "execution_prompt": "long enough prompt",
            "working_directory": "/tmp",
            "model": "gpt4"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mcp_endpoint_enforces_strict_rules() {
    let server = test_server().await;
    let good_system = "You are a meticulous engineer channeling John Carmack: simple, \
                       direct, and minimal in every change you make to the codebase.";
    let good_prompt = format!(
        "{} then update src/lib.rs accordingly and run the full suite",
        "detail ".repeat(25)
    );

    // Missing the required token.
    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/mcp/tasks",
        Some(json!({
            "system_prompt": "You are a meticulous engineer: simple, direct, and minimal in \
                              every change you make to the codebase, with great care.",
            "execution_prompt": good_prompt,
            "working_directory": "/tmp",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("John Carmack"));

    // Prompt without a path-like string.
    let (status, _) = request(
        &server.router,
        "POST",
        "/api/v1/mcp/tasks",
        Some(json!({
            "system_prompt": good_system,
            "execution_prompt": "no path here ".repeat(20),
            "working_directory": "/tmp",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Valid strict payload is accepted and runs.
    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/mcp/tasks",
        Some(json!({
            "system_prompt": good_system,
            "execution_prompt": good_prompt,
            "working_directory": "/tmp",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let task_id = body["id"].as_i64().unwrap();
    assert_eq!(
        wait_for_terminal(&server.store, task_id).await,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn unknown_ids_return_404() {
    let server = test_server().await;

    let (status, _) = request(&server.router, "GET", "/api/v1/tasks/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(&server.router, "GET", "/api/v1/orchestrations/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(&server.router, "DELETE", "/api/v1/tasks/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn orchestration_rejects_bad_graphs() {
    let server = test_server().await;

    // Empty orchestration.
    let (status, _) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({"tasks": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Duplicate identifiers.
    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({
            "tasks": [
                {"identifier": "dup", "execution_prompt": "first duplicate task", "working_directory": "/tmp"},
                {"identifier": "dup", "execution_prompt": "second duplicate task", "working_directory": "/tmp"},
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Duplicate"));

    // Bad identifier charset.
    let (status, _) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({
            "tasks": [
                {"identifier": "has space", "execution_prompt": "task with a bad name", "working_directory": "/tmp"},
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Delay out of bounds.
    let (status, _) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({
            "tasks": [
                {"identifier": "slowpoke", "execution_prompt": "waits far too long", "working_directory": "/tmp", "initial_delay": 4000.0},
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Missing dependency reference.
    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({
            "tasks": [
                {"identifier": "a", "execution_prompt": "depends on a ghost", "working_directory": "/tmp", "depends_on": ["ghost"]},
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn cycle_rejection_leaves_no_active_rows() {
    let server = test_server().await;

    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({
            "tasks": [
                {"identifier": "x", "execution_prompt": "cyclical task number one", "working_directory": "/tmp", "depends_on": ["z"]},
                {"identifier": "y", "execution_prompt": "cyclical task number two", "working_directory": "/tmp", "depends_on": ["x"]},
                {"identifier": "z", "execution_prompt": "cyclical task number three", "working_directory": "/tmp", "depends_on": ["y"]},
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Circular dependency"));

    // The stored orchestration is failed with zero non-terminal tasks.
    let orchestrations = server.orchestrations.list(None, 10).await.unwrap();
    assert_eq!(orchestrations.len(), 1);
    assert_eq!(orchestrations[0].status.as_str(), "failed");

    let tasks = server
        .store
        .get_tasks_by_orchestration(orchestrations[0].id)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 3);
    for task in tasks {
        assert!(task.status.is_terminal(), "task {} still active", task.id);
    }
}

#[tokio::test]
async fn clear_and_delete_endpoints() {
    let server = test_server().await;

    let (_, body) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"execution_prompt": "task to be cleared", "working_directory": "/tmp"})),
    )
    .await;
    let task_id = body["id"].as_i64().unwrap();
    wait_for_terminal(&server.store, task_id).await;

    // Listing shows it.
    let (status, body) = request(&server.router, "GET", "/api/v1/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Clear removes terminal tasks; a second clear is a no-op.
    let (status, body) = request(&server.router, "POST", "/api/v1/tasks/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
    let (_, body) = request(&server.router, "POST", "/api/v1/tasks/clear", None).await;
    assert_eq!(body["deleted"], 0);

    // Delete of a terminal task succeeds; of an active one, 400.
    let (_, body) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"execution_prompt": "task to be deleted", "working_directory": "/tmp"})),
    )
    .await;
    let task_id = body["id"].as_i64().unwrap();
    wait_for_terminal(&server.store, task_id).await;
    let (status, body) = request(
        &server.router,
        "DELETE",
        &format!("/api/v1/tasks/{task_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
}

#[tokio::test]
async fn orchestration_listing_filters_by_status() {
    let server = test_server().await;

    let (_, body) = request(
        &server.router,
        "POST",
        "/api/v1/orchestrations",
        Some(json!({
            "tasks": [
                {"identifier": "solo", "execution_prompt": "a task that completes", "working_directory": "/tmp"},
            ]
        })),
    )
    .await;
    let orch_id = body["orchestration_id"].as_i64().unwrap();
    common::wait_for_orchestration(&server.orchestrations, orch_id).await;

    let (status, body) = request(
        &server.router,
        "GET",
        "/api/v1/orchestrations?status=completed",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = request(
        &server.router,
        "GET",
        "/api/v1/orchestrations?status=failed",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    let (status, _) = request(
        &server.router,
        "GET",
        "/api/v1/orchestrations?status=bogus",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
