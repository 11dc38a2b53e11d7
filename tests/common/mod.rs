//! Shared test fixtures: an in-memory server wired to the mock runtime.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use claude_cto::adapters::http::{build_router, AppState};
use claude_cto::adapters::runtime::MockRuntime;
use claude_cto::adapters::sqlite::{open_test_db, SqliteOrchestrationStore, SqliteTaskStore};
use claude_cto::domain::models::{Config, ResourceConfig, TaskStatus};
use claude_cto::infrastructure::process::ProcessRegistry;
use claude_cto::services::{
    CircuitBreakerConfig, CircuitBreakers, MemoryMonitor, Orchestrator, RetryPolicy,
    SoundNotifier, TaskRunner,
};

pub struct TestServer {
    pub router: Router,
    pub runtime: Arc<MockRuntime>,
    pub store: SqliteTaskStore,
    pub orchestrations: SqliteOrchestrationStore,
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
}

/// Build a fully wired server over an in-memory database and the mock
/// agent runtime, with fast retry delays.
pub async fn test_server() -> TestServer {
    let pool = open_test_db().await.expect("test database");
    let store = SqliteTaskStore::new(pool.clone());
    let orchestrations = SqliteOrchestrationStore::new(pool);

    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(MockRuntime::new());
    let registry = Arc::new(ProcessRegistry::new(dir.path().join("registry.json")));
    let breakers = Arc::new(CircuitBreakers::new(
        CircuitBreakerConfig::default(),
        dir.path().join("circuit_breakers.json"),
    ));
    let policy = RetryPolicy {
        jitter: false,
        initial_delay: Duration::from_millis(5),
        rate_limit_initial_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let monitor = Arc::new(MemoryMonitor::new(ResourceConfig::default()));

    let runner = TaskRunner::new(
        store.clone(),
        runtime.clone(),
        registry,
        breakers,
        policy,
        Arc::new(SoundNotifier::disabled()),
        monitor,
        dir.path().join("tasks"),
        dir.path().join("events.log"),
        None,
    );
    let orchestrator = Orchestrator::new(store.clone(), orchestrations.clone(), runner.clone());

    let state = Arc::new(AppState {
        tasks: store.clone(),
        orchestrations: orchestrations.clone(),
        runner,
        orchestrator,
        config: Config::default(),
        task_log_dir: dir.path().join("tasks"),
        isolated: None,
    });

    TestServer {
        router: build_router(state),
        runtime,
        store,
        orchestrations,
        dir,
    }
}

/// Issue one request against the router and decode the JSON response.
pub async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request"),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// Poll the store until the task reaches a terminal status.
pub async fn wait_for_terminal(store: &SqliteTaskStore, task_id: i64) -> TaskStatus {
    for _ in 0..400 {
        if let Ok(Some(task)) = store.get_task(task_id).await {
            if task.status.is_terminal() {
                return task.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal status");
}

/// Poll until the orchestration reaches a terminal status.
pub async fn wait_for_orchestration(
    orchestrations: &SqliteOrchestrationStore,
    id: i64,
) -> claude_cto::domain::models::Orchestration {
    for _ in 0..600 {
        if let Ok(Some(orch)) = orchestrations.get(id).await {
            if orch.status.is_terminal() {
                return orch;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("orchestration {id} never reached a terminal status");
}
