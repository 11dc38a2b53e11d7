//! SQLite implementation of the task store.
//!
//! Single source of truth for task state. Every operation acquires a
//! connection from the pool for its own duration; nothing holds a
//! connection across requests.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ClaudeModel, NewTask, Task, TaskStatus};
use crate::infrastructure::paths::{log_filename, LogKind};

/// Bounded retry for reads over a flaky connection: 3 attempts,
/// 0.5s initial delay, doubling.
const READ_RETRY_ATTEMPTS: u32 = 3;
const READ_RETRY_INITIAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: i64,
    status: String,
    pid: Option<i64>,
    working_directory: String,
    system_prompt: String,
    execution_prompt: String,
    model: String,
    log_file_path: Option<String>,
    last_action_cache: Option<String>,
    final_summary: Option<String>,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    updated_at: Option<String>,
    orchestration_id: Option<i64>,
    identifier: Option<String>,
    depends_on: Option<String>,
    initial_delay: Option<f64>,
    dependency_failed_at: Option<String>,
}

fn parse_ts(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::SerializationError(format!("bad timestamp '{raw}': {e}")))
}

fn parse_ts_opt(raw: Option<&String>) -> DomainResult<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(s)).transpose()
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> DomainResult<Self> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("bad status '{}'", row.status)))?;
        let model = ClaudeModel::from_str(&row.model)
            .ok_or_else(|| DomainError::SerializationError(format!("bad model '{}'", row.model)))?;
        let depends_on = row
            .depends_on
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;

        Ok(Task {
            id: row.id,
            status,
            pid: row.pid.map(|p| p as i32),
            working_directory: row.working_directory,
            system_prompt: row.system_prompt,
            execution_prompt: row.execution_prompt,
            model,
            log_file_path: row.log_file_path,
            last_action_cache: row.last_action_cache,
            final_summary: row.final_summary,
            error_message: row.error_message,
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_ts_opt(row.started_at.as_ref())?,
            ended_at: parse_ts_opt(row.ended_at.as_ref())?,
            updated_at: parse_ts_opt(row.updated_at.as_ref())?,
            orchestration_id: row.orchestration_id,
            identifier: row.identifier,
            depends_on,
            initial_delay: row.initial_delay,
            dependency_failed_at: parse_ts_opt(row.dependency_failed_at.as_ref())?,
        })
    }
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a task record and its log file path.
    ///
    /// Two phases: insert to obtain the id, then derive the deterministic
    /// log filename from `(id, working_directory, timestamp)` and update
    /// the row. The id keeps filenames unique under rapid creation.
    pub async fn create_task(&self, input: &NewTask, log_dir: &Path) -> DomainResult<Task> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO tasks (status, working_directory, system_prompt, execution_prompt,
               model, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(&input.working_directory)
        .bind(&input.system_prompt)
        .bind(&input.execution_prompt)
        .bind(input.model.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let filename = log_filename(id, &input.working_directory, LogKind::Summary, now);
        let log_path = log_dir.join(filename);

        sqlx::query("UPDATE tasks SET log_file_path = ?, updated_at = ? WHERE id = ?")
            .bind(log_path.to_string_lossy().as_ref())
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.get_task(id)
            .await?
            .ok_or(DomainError::TaskNotFound(id))
    }

    /// Attach a freshly created task to an orchestration: records the
    /// DAG-local identifier, dependencies, and delay, and moves the task
    /// to WAITING so the orchestrator gates its start.
    pub async fn attach_to_orchestration(
        &self,
        task_id: i64,
        orchestration_id: i64,
        identifier: &str,
        depends_on: Option<&[String]>,
        initial_delay: Option<f64>,
    ) -> DomainResult<()> {
        let depends_json = depends_on.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"UPDATE tasks SET orchestration_id = ?, identifier = ?, depends_on = ?,
               initial_delay = ?, status = ?, updated_at = ? WHERE id = ?"#,
        )
        .bind(orchestration_id)
        .bind(identifier)
        .bind(depends_json)
        .bind(initial_delay)
        .bind(TaskStatus::Waiting.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task_id));
        }
        Ok(())
    }

    pub async fn get_task(&self, id: i64) -> DomainResult<Option<Task>> {
        let pool = self.pool.clone();
        let row = self
            .read_with_retry(move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&pool)
                        .await
                }
            })
            .await?;
        row.map(Task::try_from).transpose()
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<i64>,
    ) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks");
        if status.is_some() {
            query.push_str(" WHERE status = ?");
        }
        query.push_str(" ORDER BY id");
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }
        if let Some(limit) = limit {
            q = q.bind(limit);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    pub async fn get_tasks_by_orchestration(
        &self,
        orchestration_id: i64,
    ) -> DomainResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE orchestration_id = ? ORDER BY id",
        )
        .bind(orchestration_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Transition a task's status, enforcing the lifecycle lattice.
    ///
    /// `started_at` is stamped exactly once, on the first transition into
    /// RUNNING. Transitions out of a terminal state are rejected.
    pub async fn update_task_status(
        &self,
        id: i64,
        new_status: TaskStatus,
    ) -> DomainResult<Task> {
        let task = self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))?;
        if task.status == new_status {
            return Ok(task);
        }
        if !task.status.can_transition_to(new_status) {
            return Err(DomainError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        let now = Utc::now();
        if new_status == TaskStatus::Running && task.started_at.is_none() {
            sqlx::query("UPDATE tasks SET status = ?, started_at = ?, updated_at = ? WHERE id = ?")
                .bind(new_status.as_str())
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
                .bind(new_status.as_str())
                .bind(now.to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))
    }

    /// Record the runner pid for a task.
    pub async fn set_task_pid(&self, id: i64, pid: i32) -> DomainResult<()> {
        sqlx::query("UPDATE tasks SET pid = ?, updated_at = ? WHERE id = ?")
            .bind(pid)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append one line to the task's summary log and refresh the
    /// last-action cache.
    ///
    /// The file append happens before the cache update: a concurrent
    /// reader may observe the old cache with the new line already in the
    /// log, never the reverse. Empty lines are logged but do not replace
    /// the cache.
    pub async fn append_progress(&self, id: i64, line: &str) -> DomainResult<()> {
        let task = self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))?;
        let Some(log_path) = task.log_file_path else {
            return Ok(());
        };

        if let Some(parent) = Path::new(&log_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(file, "{line}")?;

        if !line.trim().is_empty() {
            sqlx::query("UPDATE tasks SET last_action_cache = ?, updated_at = ? WHERE id = ?")
                .bind(line)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Finalize a task into a terminal status.
    ///
    /// The message is routed into `final_summary` on COMPLETED and into
    /// `error_message` otherwise.
    pub async fn finalize_task(
        &self,
        id: i64,
        terminal_status: TaskStatus,
        message: &str,
    ) -> DomainResult<Task> {
        let task = self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))?;
        if !terminal_status.is_terminal() {
            return Err(DomainError::ValidationFailed(format!(
                "finalize_task requires a terminal status, got {}",
                terminal_status.as_str()
            )));
        }
        if task.status.is_terminal() {
            return Ok(task);
        }
        if !task.status.can_transition_to(terminal_status) {
            return Err(DomainError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: terminal_status.as_str().to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let query = if terminal_status == TaskStatus::Completed {
            "UPDATE tasks SET status = ?, final_summary = ?, ended_at = ?, updated_at = ? WHERE id = ?"
        } else {
            "UPDATE tasks SET status = ?, error_message = ?, ended_at = ?, updated_at = ? WHERE id = ?"
        };
        sqlx::query(query)
            .bind(terminal_status.as_str())
            .bind(message)
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))
    }

    /// Mark a task skipped because a dependency failed or was cancelled.
    pub async fn mark_skipped(&self, id: i64, reason: &str) -> DomainResult<Task> {
        let task = self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if !task.status.can_transition_to(TaskStatus::Skipped) {
            return Err(DomainError::InvalidStateTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::Skipped.as_str().to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE tasks SET status = ?, error_message = ?, dependency_failed_at = ?,
               ended_at = ?, updated_at = ? WHERE id = ?"#,
        )
        .bind(TaskStatus::Skipped.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))
    }

    /// Mark a task failed with a reason, from any non-terminal state.
    pub async fn mark_failed(&self, id: i64, reason: &str) -> DomainResult<Task> {
        let task = self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE tasks SET status = ?, error_message = ?, ended_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_task(id).await?.ok_or(DomainError::TaskNotFound(id))
    }

    /// Bulk-delete terminal COMPLETED/FAILED tasks. Active tasks are never
    /// touched. Returns the number of rows removed.
    pub async fn clear_completed_tasks(&self) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE status IN (?, ?)")
            .bind(TaskStatus::Completed.as_str())
            .bind(TaskStatus::Failed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a single task. Refuses RUNNING, PENDING, and WAITING tasks
    /// (a WAITING task may still be promoted by its orchestration).
    pub async fn delete_task(&self, id: i64) -> DomainResult<bool> {
        let Some(task) = self.get_task(id).await? else {
            return Ok(false);
        };
        if matches!(
            task.status,
            TaskStatus::Running | TaskStatus::Pending | TaskStatus::Waiting
        ) {
            return Err(DomainError::ValidationFailed(format!(
                "Cannot delete task {} in {} state",
                id,
                task.status.as_str()
            )));
        }
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    pub async fn count_running(&self) -> DomainResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(TaskStatus::Running.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn read_with_retry<T, F, Fut>(&self, op: F) -> DomainResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut delay = READ_RETRY_INITIAL;
        let mut last_err: Option<sqlx::Error> = None;
        for attempt in 0..READ_RETRY_ATTEMPTS {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_transient_db_error(&e) || attempt + 1 == READ_RETRY_ATTEMPTS {
                        return Err(e.into());
                    }
                    tracing::warn!(error = %e, attempt = attempt + 1, "database read failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| DomainError::DatabaseError("read retry exhausted".to_string())))
    }
}

/// Whether a sqlx error is worth a bounded read retry.
fn is_transient_db_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    ) || matches!(err, sqlx::Error::Database(db) if db.message().contains("locked")
        || db.message().contains("busy"))
}
