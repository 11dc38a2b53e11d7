//! Startup recovery.
//!
//! Runs once on server startup, before the API accepts requests, and
//! reconciles the store, the process registry, and the OS process table.
//! Tasks are never resumed: a task that died mid-stream is declared
//! failed, and recovery is done once the store is internally consistent.
//! The routine is idempotent; a second back-to-back run changes nothing.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::sqlite::SqliteTaskStore;
use crate::domain::errors::DomainResult;
use crate::domain::models::TaskStatus;

use super::probe;
use super::registry::ProcessRegistry;
use super::server_lock::ServerLock;

/// Running tasks older than this are declared crashed regardless of pid
/// state. Model timeout ceilings (max 60 min) keep legitimate runs below
/// this back-stop.
const MAX_TASK_RUNTIME_HOURS: i64 = 2;
/// Running tasks with no recorded pid are failed after this age.
const MAX_PIDLESS_AGE_HOURS: i64 = 1;

/// What recovery did, for the startup log.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    pub stale_locks_cleaned: usize,
    pub agent_processes_terminated: usize,
    pub orphaned_processes_killed: usize,
    pub tasks_marked_failed: usize,
    pub registry_entries_cleaned: usize,
}

/// Startup recovery service.
pub struct RecoveryService {
    store: SqliteTaskStore,
    registry: Arc<ProcessRegistry>,
    lock_dir: PathBuf,
}

impl RecoveryService {
    pub fn new(store: SqliteTaskStore, registry: Arc<ProcessRegistry>, lock_dir: PathBuf) -> Self {
        Self {
            store,
            registry,
            lock_dir,
        }
    }

    /// Full recovery routine. Ends by registering this server instance.
    pub async fn recover_on_startup(&self, port: u16) -> DomainResult<RecoveryReport> {
        tracing::info!("starting server recovery");
        let mut report = RecoveryReport::default();

        report.stale_locks_cleaned = ServerLock::cleanup_all_locks(&self.lock_dir);
        report.agent_processes_terminated = self.terminate_stray_agents().await;
        report.orphaned_processes_killed = self.registry.cleanup_orphans().await;
        report.tasks_marked_failed = self.reconcile_task_states().await?;
        report.registry_entries_cleaned = self.registry.cleanup_old_entries(7).await;
        self.registry.register_server(port).await;

        tracing::info!(?report, "recovery complete");
        Ok(report)
    }

    /// Find agent CLI processes carrying the entrypoint marker whose
    /// parent is no longer a live server of ours, and terminate them.
    async fn terminate_stray_agents(&self) -> usize {
        let mut terminated = 0;
        for pid in probe::scan_marked_processes() {
            let parent = probe::parent_pid(pid);
            let parent_is_ours = parent
                .map(|p| probe::pid_alive(p) && probe::is_our_process(p))
                .unwrap_or(false);
            if parent_is_ours {
                continue;
            }

            tracing::warn!(pid, "terminating stray agent process");
            if probe::terminate_with_grace(pid, Duration::from_secs(5)).await {
                terminated += 1;
            }
        }
        if terminated > 0 {
            tracing::info!(terminated, "terminated stray agent processes");
        }
        terminated
    }

    /// Mark RUNNING tasks whose process evidence contradicts them as
    /// FAILED with a recovery reason.
    async fn reconcile_task_states(&self) -> DomainResult<usize> {
        let mut marked = 0;
        let running = self.store.list_tasks(Some(TaskStatus::Running), None).await?;
        let now = Utc::now();

        for task in running {
            let runtime_exceeded = task
                .started_at
                .map(|s| now - s > ChronoDuration::hours(MAX_TASK_RUNTIME_HOURS))
                .unwrap_or(false);

            let reason = if runtime_exceeded {
                Some("Task exceeded maximum runtime (2 hours)".to_string())
            } else if let Some(pid) = task.pid {
                if !probe::pid_alive(pid) {
                    Some("Task process no longer exists".to_string())
                } else if !probe::is_our_process(pid) {
                    Some("PID exists but is not a claude-cto process".to_string())
                } else {
                    None
                }
            } else if now - task.created_at > ChronoDuration::hours(MAX_PIDLESS_AGE_HOURS) {
                Some("Old task with no PID recorded".to_string())
            } else {
                None
            };

            if let Some(reason) = reason {
                self.store
                    .mark_failed(task.id, &format!("Recovery: {reason}"))
                    .await?;
                self.registry.mark_task_completed(task.id).await;
                marked += 1;
                tracing::info!(task_id = task.id, %reason, "marked task failed during recovery");
            }
        }
        Ok(marked)
    }
}
