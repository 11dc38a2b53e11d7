//! Orchestrator: drives one DAG of tasks to completion.
//!
//! Validates the dependency graph, launches one concurrent worker per
//! task, gates each worker on its predecessors' completion signals,
//! propagates failure as SKIPPED, and aggregates terminal counters onto
//! the orchestration row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::adapters::sqlite::{SqliteOrchestrationStore, SqliteTaskStore};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{OrchestrationStatus, TaskStatus};

use super::task_runner::TaskRunner;

/// Reason a task is skipped when a predecessor did not complete.
pub const SKIP_REASON: &str = "Skipped due to dependency failure";

/// Validate a dependency graph: every reference must name an existing
/// sibling and the digraph must be acyclic.
///
/// Cycle detection is a DFS with gray/black coloring; a back-edge to a
/// gray node is a cycle.
pub fn validate_graph(graph: &HashMap<String, Vec<String>>) -> DomainResult<()> {
    for (task, deps) in graph {
        for dep in deps {
            if !graph.contains_key(dep) {
                return Err(DomainError::InvalidDependency {
                    task: task.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        colors: &mut HashMap<String, Color>,
    ) -> Option<String> {
        colors.insert(node.to_string(), Color::Gray);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                    Color::Gray => return Some(dep.clone()),
                    Color::White => {
                        if let Some(cycle_node) = visit(dep, graph, colors) {
                            return Some(cycle_node);
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        colors.insert(node.to_string(), Color::Black);
        None
    }

    let mut colors: HashMap<String, Color> = HashMap::new();
    let mut nodes: Vec<&String> = graph.keys().collect();
    nodes.sort();
    for node in nodes {
        if colors.get(node.as_str()).copied().unwrap_or(Color::White) == Color::White {
            if let Some(cycle_node) = visit(node, graph, &mut colors) {
                return Err(DomainError::CycleDetected(cycle_node));
            }
        }
    }
    Ok(())
}

/// Orchestrator for one DAG.
#[derive(Clone)]
pub struct Orchestrator {
    store: SqliteTaskStore,
    orchestrations: SqliteOrchestrationStore,
    runner: TaskRunner,
}

impl Orchestrator {
    pub fn new(
        store: SqliteTaskStore,
        orchestrations: SqliteOrchestrationStore,
        runner: TaskRunner,
    ) -> Self {
        Self {
            store,
            orchestrations,
            runner,
        }
    }

    /// Drive every child task to a terminal state and the orchestration
    /// to a terminal status. Precondition: the store holds the
    /// orchestration row and its child tasks in WAITING.
    pub async fn run(&self, orchestration_id: i64) -> DomainResult<()> {
        let tasks = self.store.get_tasks_by_orchestration(orchestration_id).await?;

        // identifier -> id and identifier -> dependencies.
        let mut task_ids: HashMap<String, i64> = HashMap::new();
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();
        let mut delays: HashMap<String, Option<f64>> = HashMap::new();
        for task in &tasks {
            let Some(identifier) = task.identifier.clone() else {
                continue;
            };
            task_ids.insert(identifier.clone(), task.id);
            graph.insert(identifier.clone(), task.dependencies().to_vec());
            delays.insert(identifier, task.initial_delay);
        }

        if let Err(e) = validate_graph(&graph) {
            tracing::error!(orchestration_id, error = %e, "orchestration graph invalid");
            self.orchestrations
                .update_status(orchestration_id, OrchestrationStatus::Failed)
                .await?;
            return Err(e);
        }

        // One single-set completion signal and one status slot per task.
        let mut senders: HashMap<String, watch::Sender<bool>> = HashMap::new();
        let mut receivers: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        for identifier in task_ids.keys() {
            let (tx, rx) = watch::channel(false);
            senders.insert(identifier.clone(), tx);
            receivers.insert(identifier.clone(), rx);
            statuses.insert(identifier.clone(), TaskStatus::Waiting);
        }
        let statuses = Arc::new(Mutex::new(statuses));

        self.orchestrations
            .update_status(orchestration_id, OrchestrationStatus::Running)
            .await?;

        let mut workers = Vec::new();
        for (identifier, task_id) in &task_ids {
            let worker = TaskWorker {
                identifier: identifier.clone(),
                task_id: *task_id,
                dependencies: graph.get(identifier).cloned().unwrap_or_default(),
                initial_delay: delays.get(identifier).copied().flatten(),
                store: self.store.clone(),
                runner: self.runner.clone(),
                statuses: Arc::clone(&statuses),
                own_signal: senders
                    .remove(identifier)
                    .expect("signal exists for every task"),
                dep_signals: receivers.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(orchestration_id, error = %e, "orchestration worker panicked");
            }
        }

        // Aggregate under the same lock the workers published through.
        let (completed, failed, skipped) = {
            let statuses = statuses.lock().await;
            let mut counts = (0i64, 0i64, 0i64);
            for status in statuses.values() {
                match status {
                    TaskStatus::Completed => counts.0 += 1,
                    TaskStatus::Failed => counts.1 += 1,
                    TaskStatus::Skipped => counts.2 += 1,
                    _ => {}
                }
            }
            counts
        };

        // Even one failure makes the whole orchestration FAILED,
        // regardless of how many were merely skipped. A cancel that
        // landed while workers were draining wins over both.
        let cancelled = self
            .orchestrations
            .get(orchestration_id)
            .await?
            .map(|o| o.status == OrchestrationStatus::Cancelled)
            .unwrap_or(false);
        let final_status = if cancelled {
            OrchestrationStatus::Cancelled
        } else if failed == 0 {
            OrchestrationStatus::Completed
        } else {
            OrchestrationStatus::Failed
        };
        self.orchestrations
            .finalize(orchestration_id, final_status, completed, failed, skipped)
            .await?;
        tracing::info!(
            orchestration_id,
            status = final_status.as_str(),
            completed,
            failed,
            skipped,
            "orchestration finished"
        );
        Ok(())
    }
}

/// One concurrent worker per task in the DAG.
struct TaskWorker {
    identifier: String,
    task_id: i64,
    dependencies: Vec<String>,
    initial_delay: Option<f64>,
    store: SqliteTaskStore,
    runner: TaskRunner,
    statuses: Arc<Mutex<HashMap<String, TaskStatus>>>,
    own_signal: watch::Sender<bool>,
    dep_signals: HashMap<String, watch::Receiver<bool>>,
}

impl TaskWorker {
    async fn run(self) {
        // Await every predecessor's completion signal.
        for dep in &self.dependencies {
            if let Some(rx) = self.dep_signals.get(dep) {
                let mut rx = rx.clone();
                let _ = rx.wait_for(|done| *done).await;
            }
        }

        // Reads of peer statuses happen under the shared mutex.
        let dependency_failed = {
            let statuses = self.statuses.lock().await;
            self.dependencies.iter().any(|dep| {
                matches!(
                    statuses.get(dep),
                    Some(TaskStatus::Failed) | Some(TaskStatus::Skipped)
                )
            })
        };

        if dependency_failed {
            if let Err(e) = self.store.mark_skipped(self.task_id, SKIP_REASON).await {
                tracing::error!(task_id = self.task_id, error = %e, "failed to mark task skipped");
            }
            self.publish(TaskStatus::Skipped).await;
            return;
        }

        if let Some(delay) = self.initial_delay {
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        // Promote WAITING -> PENDING. A cancelled task is already
        // terminal here; publish what the store holds and stop.
        match self
            .store
            .update_task_status(self.task_id, TaskStatus::Pending)
            .await
        {
            Ok(_) => {}
            Err(_) => {
                let status = self
                    .store
                    .get_task(self.task_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::Failed);
                self.publish(status).await;
                return;
            }
        }

        self.runner.run(self.task_id).await;

        let terminal = self
            .store
            .get_task(self.task_id)
            .await
            .ok()
            .flatten()
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Failed);
        self.publish(terminal).await;
    }

    /// Publish the terminal status and set the single-set signal.
    async fn publish(&self, status: TaskStatus) {
        {
            let mut statuses = self.statuses.lock().await;
            statuses.insert(self.identifier.clone(), status);
        }
        let _ = self.own_signal.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(node, deps)| {
                (
                    (*node).to_string(),
                    deps.iter().map(|d| (*d).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_valid_graph_accepted() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_missing_reference_rejected() {
        let g = graph(&[("a", &["ghost"])]);
        let err = validate_graph(&g).unwrap_err();
        assert!(matches!(err, DomainError::InvalidDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let g = graph(&[("x", &["z"]), ("y", &["x"]), ("z", &["y"])]);
        let err = validate_graph(&g).unwrap_err();
        assert!(matches!(err, DomainError::CycleDetected(_)));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let g = graph(&[("a", &["a"])]);
        assert!(matches!(
            validate_graph(&g).unwrap_err(),
            DomainError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert!(validate_graph(&g).is_ok());
    }
}
