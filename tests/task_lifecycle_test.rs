//! End-to-end task lifecycle through the HTTP API with a scripted
//! runtime: happy path, transient retry, and permanent failure.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use claude_cto::adapters::runtime::{AgentError, MockAttempt};
use claude_cto::domain::models::TaskStatus;
use common::{request, test_server, wait_for_terminal};

#[tokio::test]
async fn happy_path_task_completes() {
    let server = test_server().await;

    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "execution_prompt": "hello world",
            "working_directory": "/tmp",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["id"].as_i64().expect("task id");
    assert_eq!(body["status"], "pending");

    let terminal = wait_for_terminal(&server.store, task_id).await;
    assert_eq!(terminal, TaskStatus::Completed);

    let task = server.store.get_task(task_id).await.unwrap().unwrap();
    assert!(task
        .final_summary
        .as_deref()
        .unwrap()
        .starts_with("Task completed successfully (2 messages)"));

    // The summary log holds exactly the two progress lines, in order.
    let log = std::fs::read_to_string(task.log_file_path.unwrap()).unwrap();
    let lines: Vec<&str> = log.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("[tool:bash] echo hi"));
    assert!(lines[1].contains("[text] done"));

    // Read-back through the API returns the persisted terminal fields.
    let (status, body) = request(
        &server.router,
        "GET",
        &format!("/api/v1/tasks/{task_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert!(body["started_at"].is_string());
    assert!(body["ended_at"].is_string());
}

#[tokio::test]
async fn transient_errors_retry_to_success() {
    let server = test_server().await;

    // Ids are dense and store-assigned: the first task in a fresh
    // database gets id 1, so the attempts can be scripted up front.
    server
        .runtime
        .script_task(
            1,
            vec![
                MockAttempt::failure(AgentError::Connection("blip one".into())),
                MockAttempt::failure(AgentError::Connection("blip two".into())),
                MockAttempt::happy_path(),
            ],
        )
        .await;

    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "execution_prompt": "retry until it works",
            "working_directory": "/tmp",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["id"].as_i64().unwrap();
    assert_eq!(task_id, 1);

    let terminal = wait_for_terminal(&server.store, task_id).await;
    assert_eq!(terminal, TaskStatus::Completed);

    let task = server.store.get_task(task_id).await.unwrap().unwrap();
    let summary = task.final_summary.unwrap();
    assert!(summary.contains("after 3 attempts"), "summary: {summary}");
    assert_eq!(server.runtime.attempts_started(task_id).await, 3);
}

#[tokio::test]
async fn permanent_failure_is_recorded() {
    let server = test_server().await;

    server
        .runtime
        .script_task(
            1,
            vec![MockAttempt::failure(AgentError::CliNotFound { path: None })],
        )
        .await;

    let (status, body) = request(
        &server.router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "execution_prompt": "this will fail hard",
            "working_directory": "/tmp",
        })),
    )
    .await;
    // Task accepted even though it will fail.
    assert_eq!(status, StatusCode::OK);
    let task_id = body["id"].as_i64().unwrap();

    let terminal = wait_for_terminal(&server.store, task_id).await;
    assert_eq!(terminal, TaskStatus::Failed);

    let task = server.store.get_task(task_id).await.unwrap().unwrap();
    let message = task.error_message.unwrap();
    assert!(message.starts_with("[CLINotFoundError]"), "message: {message}");
    assert!(message.contains("Install Claude CLI"));
}

#[tokio::test]
async fn monotone_lifecycle_under_load() {
    let server = test_server().await;
    let mut ids = Vec::new();

    for i in 0..5 {
        let (status, body) = request(
            &server.router,
            "POST",
            "/api/v1/tasks",
            Some(json!({
                "execution_prompt": format!("parallel task number {i}"),
                "working_directory": "/tmp",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        ids.push(body["id"].as_i64().unwrap());
    }

    for id in ids {
        let terminal = wait_for_terminal(&server.store, id).await;
        assert_eq!(terminal, TaskStatus::Completed);

        // Terminal finality: timestamps are consistent and fixed.
        let task = server.store.get_task(id).await.unwrap().unwrap();
        assert!(task.started_at.unwrap() <= task.ended_at.unwrap());
        let again = server.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(again.ended_at, task.ended_at);
    }
}
