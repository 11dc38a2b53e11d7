//! Task runner: drives one task from admission to a terminal state.
//!
//! The runner loads the task, opens the agent runtime stream, ingests
//! progress messages into the summary log and the store, races each
//! attempt against the model's timeout ceiling, retries transient
//! failures through the shared retry policy, and always finalizes.
//! Callers never receive a result; they observe the store.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::adapters::runtime::{claude_code, AgentError};
use crate::adapters::sqlite::SqliteTaskStore;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentRequest, ContentBlock, Task, TaskStatus};
use crate::domain::ports::AgentRuntime;
use crate::infrastructure::process::ProcessRegistry;
use crate::infrastructure::task_logger::TaskLogger;

use super::circuit_breaker::CircuitBreakers;
use super::log_formatter::summarize_message;
use super::memory_monitor::MemoryMonitor;
use super::notification::{SoundEvent, SoundNotifier};
use super::retry::{execute_with_retry, RetryError, RetryPolicy};

/// Everything a runner needs, shared across all task executions.
#[derive(Clone)]
pub struct TaskRunner {
    store: SqliteTaskStore,
    runtime: Arc<dyn AgentRuntime>,
    registry: Arc<ProcessRegistry>,
    breakers: Arc<CircuitBreakers>,
    policy: RetryPolicy,
    notifier: Arc<SoundNotifier>,
    monitor: Arc<MemoryMonitor>,
    task_log_dir: PathBuf,
    events_log: PathBuf,
    memory_limit_mb: Option<u64>,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SqliteTaskStore,
        runtime: Arc<dyn AgentRuntime>,
        registry: Arc<ProcessRegistry>,
        breakers: Arc<CircuitBreakers>,
        policy: RetryPolicy,
        notifier: Arc<SoundNotifier>,
        monitor: Arc<MemoryMonitor>,
        task_log_dir: PathBuf,
        events_log: PathBuf,
        memory_limit_mb: Option<u64>,
    ) -> Self {
        Self {
            store,
            runtime,
            registry,
            breakers,
            policy,
            notifier,
            monitor,
            task_log_dir,
            events_log,
            memory_limit_mb,
        }
    }

    /// Drive the task to a terminal state. Never propagates errors to the
    /// scheduler: programming failures are logged and the task is still
    /// finalized FAILED when possible.
    pub async fn run(&self, task_id: i64) {
        if let Err(e) = self.execute(task_id).await {
            tracing::error!(task_id, error = %e, "task runner failed internally");
            let _ = self
                .store
                .mark_failed(task_id, &format!("Internal error: {e}"))
                .await;
            self.registry.mark_task_completed(task_id).await;
        }
    }

    async fn execute(&self, task_id: i64) -> DomainResult<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            tracing::warn!(task_id, "task runner invoked for unknown task");
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        self.store
            .update_task_status(task_id, TaskStatus::Running)
            .await?;
        let own_pid = std::process::id() as i32;
        self.store.set_task_pid(task_id, own_pid).await?;
        self.registry.register_task(task_id, own_pid).await;

        let timeout = Duration::from_secs(task.model.timeout_seconds());
        let mut logger = TaskLogger::create(
            task_id,
            &task.working_directory,
            &self.task_log_dir,
            self.events_log.clone(),
        )?;
        logger.log_start(&task.execution_prompt, task.model.as_str(), timeout.as_secs());
        self.notifier.notify(SoundEvent::Start);
        self.monitor.start_task(task_id).await;

        let started = Utc::now();
        let key = format!("task_{task_id}");
        // Shared between the attempt and the retry hook below.
        let logger = Mutex::new(logger);

        let outcome = execute_with_retry(
            &self.policy,
            &self.breakers,
            &key,
            |_attempt| self.run_attempt(&task, timeout, &logger),
            |attempt, error, delay| {
                let store = self.store.clone();
                let logger = &logger;
                let max_attempts = self.policy.max_attempts_for(self.policy.classify(&error));
                async move {
                    let line = format!(
                        "[retry] Attempt {attempt} failed, retrying in {:.0}s",
                        delay.as_secs_f64()
                    );
                    if let Err(e) = store.append_progress(task_id, &line).await {
                        tracing::warn!(task_id, error = %e, "failed to record retry notice");
                    }
                    logger.lock().await.log_retry(
                        attempt,
                        max_attempts,
                        &error.to_string(),
                        delay.as_secs_f64(),
                    );
                }
            },
        )
        .await;

        let duration = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
        let mut logger = logger.into_inner();
        match outcome {
            Ok(retried) => {
                let mut summary =
                    format!("Task completed successfully ({} messages)", retried.value);
                if retried.attempts > 1 {
                    summary.push_str(&format!(" after {} attempts", retried.attempts));
                }
                logger.log_completion(true, &summary, duration);
                self.store
                    .finalize_task(task_id, TaskStatus::Completed, &summary)
                    .await?;
                self.notifier.notify(SoundEvent::Success);
                self.monitor.end_task(task_id, true).await;
            }
            Err(retry_error) => {
                let (error, exhausted_after) = match retry_error {
                    RetryError::CircuitOpen { key } => (
                        AgentError::Other(format!(
                            "Circuit breaker open for {key}, refusing attempt"
                        )),
                        None,
                    ),
                    RetryError::Permanent(error) => (error, None),
                    RetryError::Exhausted { error, attempts } => (error, Some(attempts)),
                };
                let mut message = error.render();
                if let Some(attempts) = exhausted_after {
                    message.push_str(&format!(" | Failed after {attempts} attempts"));
                }
                let diagnostics = claude_code::diagnostics("claude").await;
                logger.log_error(&message, error.recovery_suggestions(), &diagnostics);
                logger.log_completion(false, &message, duration);
                self.store
                    .finalize_task(task_id, TaskStatus::Failed, &message)
                    .await?;
                self.notifier.notify(SoundEvent::Failure);
                self.monitor.end_task(task_id, false).await;
            }
        }

        logger.close();
        self.registry.mark_task_completed(task_id).await;
        Ok(())
    }

    /// One attempt: open the stream and drain it, racing the model's
    /// timeout ceiling. Returns the message count on a clean close.
    async fn run_attempt(
        &self,
        task: &Task,
        timeout: Duration,
        logger: &Mutex<TaskLogger>,
    ) -> Result<u64, AgentError> {
        let request = AgentRequest::new(task.id, &task.working_directory)
            .with_prompts(&task.system_prompt, &task.execution_prompt)
            .with_model(task.model)
            .with_memory_limit(self.memory_limit_mb);

        let mut stream = self.runtime.start(request).await?;
        if let Some(pid) = stream.pid {
            self.registry.record_child(task.id, pid as i32).await;
        }

        let store = self.store.clone();
        let task_id = task.id;
        let drain = async {
            let mut logger = logger.lock().await;
            let mut count = 0u64;
            while let Some(item) = stream.messages.recv().await {
                let message = item?;
                count += 1;
                logger.log_message(count, &message.kind);

                for block in &message.content {
                    if let ContentBlock::ToolUse { name, input } = block {
                        logger.log_tool(name, input);
                        break;
                    }
                }

                if let Some(line) = summarize_message(&message) {
                    store.append_progress(task_id, &line).await.map_err(|e| {
                        AgentError::Other(format!("failed to record progress: {e}"))
                    })?;
                }
            }
            Ok(count)
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                seconds: timeout.as_secs(),
            }),
        }
    }

    pub fn store(&self) -> &SqliteTaskStore {
        &self.store
    }
}

/// Admission check shared by scheduling paths: refuse when the running
/// count has reached the ceiling.
pub async fn check_admission(store: &SqliteTaskStore, limit: usize) -> DomainResult<()> {
    let running = store.count_running().await? as usize;
    if running >= limit {
        return Err(DomainError::AdmissionRefused { running, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::runtime::{MockAttempt, MockRuntime, MockStep};
    use crate::adapters::sqlite::open_test_db;
    use crate::domain::models::{AgentMessage, NewTask, ResourceConfig};
    use crate::services::circuit_breaker::CircuitBreakerConfig;

    struct Fixture {
        runner: TaskRunner,
        runtime: Arc<MockRuntime>,
        store: SqliteTaskStore,
        _dir: tempfile::TempDir,
    }

    async fn fixture(runtime: MockRuntime) -> Fixture {
        let store = SqliteTaskStore::new(open_test_db().await.unwrap());

        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(runtime);
        let registry = Arc::new(ProcessRegistry::new(dir.path().join("registry.json")));
        let breakers = Arc::new(CircuitBreakers::new(
            CircuitBreakerConfig::default(),
            dir.path().join("cb.json"),
        ));
        let policy = RetryPolicy {
            jitter: false,
            initial_delay: Duration::from_millis(10),
            rate_limit_initial_delay: Duration::from_millis(20),
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
        Fixture {
            runner,
            runtime,
            store,
            _dir: dir,
        }
    }

    async fn create_task(store: &SqliteTaskStore, dir: &std::path::Path) -> i64 {
        let input = NewTask::validate("hello world task", "/tmp", None, None).unwrap();
        store.create_task(&input, dir).await.unwrap().id
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_message_count() {
        let fx = fixture(MockRuntime::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;

        fx.runner.run(task_id).await;

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task
            .final_summary
            .unwrap()
            .starts_with("Task completed successfully (2 messages)"));
        assert!(task.started_at.unwrap() <= task.ended_at.unwrap());

        // Summary log: exactly the two progress lines, bash first.
        let log = std::fs::read_to_string(task.log_file_path.unwrap()).unwrap();
        let lines: Vec<&str> = log.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[tool:bash] echo hi"));
        assert_eq!(fx.runtime.attempts_started(task_id).await, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let runtime = MockRuntime::new();
        let fx = fixture(runtime).await;
        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;

        fx.runtime
            .script_task(
                task_id,
                vec![
                    MockAttempt::failure(AgentError::Connection("blip 1".into())),
                    MockAttempt::failure(AgentError::Connection("blip 2".into())),
                    MockAttempt::happy_path(),
                ],
            )
            .await;

        fx.runner.run(task_id).await;

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.final_summary.unwrap().contains("after 3 attempts"));
        assert_eq!(fx.runtime.attempts_started(task_id).await, 3);

        // The retry notices were appended between attempts.
        let log = std::fs::read_to_string(task.log_file_path.unwrap()).unwrap();
        let retries = log.lines().filter(|l| l.starts_with("[retry]")).count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_once() {
        let fx = fixture(MockRuntime::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;

        fx.runtime
            .script_task(
                task_id,
                vec![MockAttempt::failure(AgentError::CliNotFound { path: None })],
            )
            .await;

        fx.runner.run(task_id).await;

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let message = task.error_message.unwrap();
        assert!(message.starts_with("[CLINotFoundError]"));
        assert!(message.contains("Install Claude CLI"));
        assert_eq!(fx.runtime.attempts_started(task_id).await, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_finalizes_failed() {
        let fx = fixture(MockRuntime::with_default(MockAttempt::failure(
            AgentError::Connection("down".into()),
        )))
        .await;
        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;

        fx.runner.run(task_id).await;

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let message = task.error_message.unwrap();
        assert!(message.starts_with("[CLIConnectionError]"));
        assert!(message.contains("Failed after 3 attempts"));
        assert_eq!(fx.runtime.attempts_started(task_id).await, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        // An attempt that hangs past the ceiling surfaces as a transient
        // timeout error.
        let fx = fixture(MockRuntime::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;

        fx.runtime
            .script_task(
                task_id,
                vec![MockAttempt {
                    steps: vec![MockStep::Delay(Duration::from_secs(5))],
                }],
            )
            .await;

        // Race the drain against a 50ms ceiling instead of the model's.
        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        let logger = Mutex::new(
            TaskLogger::create(
                task_id,
                &task.working_directory,
                fx._dir.path(),
                fx._dir.path().join("events.log"),
            )
            .unwrap(),
        );
        let result = fx
            .runner
            .run_attempt(&task, Duration::from_millis(50), &logger)
            .await;
        assert!(matches!(result, Err(AgentError::Timeout { .. })));
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_last_action_cache_tracks_progress() {
        let fx = fixture(MockRuntime::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;

        fx.runtime
            .script_task(
                task_id,
                vec![MockAttempt::success(vec![
                    AgentMessage::assistant(vec![ContentBlock::Text {
                        text: "step one".into(),
                    }]),
                    AgentMessage::assistant(vec![ContentBlock::Text {
                        text: "step two".into(),
                    }]),
                ])],
            )
            .await;

        fx.runner.run(task_id).await;

        let task = fx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.last_action_cache.as_deref(), Some("[text] step two"));
    }

    #[tokio::test]
    async fn test_admission_check() {
        let fx = fixture(MockRuntime::new()).await;
        assert!(check_admission(&fx.store, 1).await.is_ok());

        let dir = tempfile::tempdir().unwrap();
        let task_id = create_task(&fx.store, dir.path()).await;
        fx.store
            .update_task_status(task_id, TaskStatus::Running)
            .await
            .unwrap();

        let refused = check_admission(&fx.store, 1).await;
        assert!(matches!(
            refused,
            Err(DomainError::AdmissionRefused { running: 1, limit: 1 })
        ));
    }
}
