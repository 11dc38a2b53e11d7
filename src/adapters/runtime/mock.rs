//! Scripted mock runtime for testing.
//!
//! Each task id gets a queue of scripted attempts; every `start` call pops
//! the next one. This makes retry and timeout paths reproducible without
//! spawning real processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::domain::models::{AgentMessage, AgentRequest, ContentBlock};
use crate::domain::ports::{AgentRuntime, AgentStream};

use super::errors::AgentError;

/// One step inside a scripted attempt.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Deliver a message.
    Message(AgentMessage),
    /// Deliver an error and end the stream.
    Error(AgentError),
    /// Sleep before the next step (drives timeout tests).
    Delay(Duration),
}

/// A scripted attempt: the steps its stream yields, in order.
#[derive(Debug, Clone, Default)]
pub struct MockAttempt {
    pub steps: Vec<MockStep>,
}

impl MockAttempt {
    /// A successful attempt yielding the given messages.
    pub fn success(messages: Vec<AgentMessage>) -> Self {
        Self {
            steps: messages.into_iter().map(MockStep::Message).collect(),
        }
    }

    /// An attempt that fails immediately.
    pub fn failure(error: AgentError) -> Self {
        Self {
            steps: vec![MockStep::Error(error)],
        }
    }

    /// A typical two-message happy path: one Bash tool use, one text.
    pub fn happy_path() -> Self {
        Self::success(vec![
            AgentMessage::assistant(vec![ContentBlock::ToolUse {
                name: "Bash".to_string(),
                input: serde_json::json!({"command": "echo hi"}),
            }]),
            AgentMessage::assistant(vec![ContentBlock::Text {
                text: "done".to_string(),
            }]),
        ])
    }
}

/// Mock runtime with per-task scripted attempts.
pub struct MockRuntime {
    scripts: Arc<Mutex<HashMap<i64, Vec<MockAttempt>>>>,
    default_attempt: MockAttempt,
    started: Arc<Mutex<HashMap<i64, u32>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            default_attempt: MockAttempt::happy_path(),
            started: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_default(default_attempt: MockAttempt) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            default_attempt,
            started: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue scripted attempts for a task. Consumed in order; once empty
    /// the default attempt is used.
    pub async fn script_task(&self, task_id: i64, attempts: Vec<MockAttempt>) {
        let mut scripts = self.scripts.lock().await;
        scripts.entry(task_id).or_default().extend(attempts);
    }

    /// How many times `start` was called for a task.
    pub async fn attempts_started(&self, task_id: i64) -> u32 {
        let started = self.started.lock().await;
        started.get(&task_id).copied().unwrap_or(0)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn probe(&self) -> Result<bool, AgentError> {
        Ok(true)
    }

    async fn start(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        {
            let mut started = self.started.lock().await;
            *started.entry(request.task_id).or_insert(0) += 1;
        }

        let attempt = {
            let mut scripts = self.scripts.lock().await;
            match scripts.get_mut(&request.task_id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => self.default_attempt.clone(),
            }
        };

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            for step in attempt.steps {
                match step {
                    MockStep::Message(message) => {
                        if tx.send(Ok(message)).await.is_err() {
                            return;
                        }
                    }
                    MockStep::Error(error) => {
                        let _ = tx.send(Err(error)).await;
                        return;
                    }
                    MockStep::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                }
            }
        });

        Ok(AgentStream { messages: rx, pid: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_attempts_consumed_in_order() {
        let runtime = MockRuntime::new();
        runtime
            .script_task(
                1,
                vec![
                    MockAttempt::failure(AgentError::Connection("blip".into())),
                    MockAttempt::happy_path(),
                ],
            )
            .await;

        let mut stream = runtime.start(AgentRequest::new(1, "/tmp")).await.unwrap();
        let first = stream.messages.recv().await.unwrap();
        assert!(first.is_err());

        let mut stream = runtime.start(AgentRequest::new(1, "/tmp")).await.unwrap();
        let mut count = 0;
        while let Some(item) = stream.messages.recv().await {
            assert!(item.is_ok());
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(runtime.attempts_started(1).await, 2);
    }

    #[tokio::test]
    async fn test_default_attempt_used_when_unscripted() {
        let runtime = MockRuntime::new();
        let mut stream = runtime.start(AgentRequest::new(5, "/tmp")).await.unwrap();
        let mut messages = vec![];
        while let Some(item) = stream.messages.recv().await {
            messages.push(item.unwrap());
        }
        assert_eq!(messages.len(), 2);
    }
}
