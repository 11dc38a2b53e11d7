//! SQLite implementation of the orchestration store.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Orchestration, OrchestrationStatus};

#[derive(Clone)]
pub struct SqliteOrchestrationStore {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct OrchestrationRow {
    id: i64,
    status: String,
    created_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    total_tasks: i64,
    completed_tasks: i64,
    failed_tasks: i64,
    skipped_tasks: i64,
}

fn parse_ts(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::SerializationError(format!("bad timestamp '{raw}': {e}")))
}

impl TryFrom<OrchestrationRow> for Orchestration {
    type Error = DomainError;

    fn try_from(row: OrchestrationRow) -> DomainResult<Self> {
        let status = OrchestrationStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::SerializationError(format!("bad orchestration status '{}'", row.status))
        })?;
        Ok(Orchestration {
            id: row.id,
            status,
            created_at: parse_ts(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_ts).transpose()?,
            ended_at: row.ended_at.as_deref().map(parse_ts).transpose()?,
            total_tasks: row.total_tasks,
            completed_tasks: row.completed_tasks,
            failed_tasks: row.failed_tasks,
            skipped_tasks: row.skipped_tasks,
        })
    }
}

impl SqliteOrchestrationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, total_tasks: i64) -> DomainResult<Orchestration> {
        let result = sqlx::query(
            "INSERT INTO orchestrations (status, created_at, total_tasks) VALUES (?, ?, ?)",
        )
        .bind(OrchestrationStatus::Pending.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(total_tasks)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get(id)
            .await?
            .ok_or(DomainError::OrchestrationNotFound(id))
    }

    pub async fn get(&self, id: i64) -> DomainResult<Option<Orchestration>> {
        let row = sqlx::query_as::<_, OrchestrationRow>("SELECT * FROM orchestrations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Orchestration::try_from).transpose()
    }

    pub async fn list(
        &self,
        status: Option<OrchestrationStatus>,
        limit: i64,
    ) -> DomainResult<Vec<Orchestration>> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, OrchestrationRow>(
                "SELECT * FROM orchestrations WHERE status = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, OrchestrationRow>(
                "SELECT * FROM orchestrations ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter().map(Orchestration::try_from).collect()
    }

    /// Update status, stamping `started_at` on the first transition to
    /// RUNNING and `ended_at` on any terminal transition.
    pub async fn update_status(
        &self,
        id: i64,
        status: OrchestrationStatus,
    ) -> DomainResult<Orchestration> {
        let current = self.get(id).await?.ok_or(DomainError::OrchestrationNotFound(id))?;
        let now = Utc::now().to_rfc3339();

        if status == OrchestrationStatus::Running && current.started_at.is_none() {
            sqlx::query("UPDATE orchestrations SET status = ?, started_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else if status.is_terminal() {
            sqlx::query("UPDATE orchestrations SET status = ?, ended_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE orchestrations SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        self.get(id).await?.ok_or(DomainError::OrchestrationNotFound(id))
    }

    /// Finalize the orchestration with aggregate counters.
    pub async fn finalize(
        &self,
        id: i64,
        status: OrchestrationStatus,
        completed: i64,
        failed: i64,
        skipped: i64,
    ) -> DomainResult<Orchestration> {
        sqlx::query(
            r#"UPDATE orchestrations SET status = ?, completed_tasks = ?, failed_tasks = ?,
               skipped_tasks = ?, ended_at = ? WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(completed)
        .bind(failed)
        .bind(skipped)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get(id).await?.ok_or(DomainError::OrchestrationNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::open_test_db;

    async fn store() -> SqliteOrchestrationStore {
        SqliteOrchestrationStore::new(open_test_db().await.unwrap())
    }

    #[tokio::test]
    async fn test_create_and_lifecycle() {
        let store = store().await;
        let orch = store.create(3).await.unwrap();
        assert_eq!(orch.status, OrchestrationStatus::Pending);
        assert_eq!(orch.total_tasks, 3);
        assert!(orch.started_at.is_none());

        let running = store
            .update_status(orch.id, OrchestrationStatus::Running)
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let done = store
            .finalize(orch.id, OrchestrationStatus::Failed, 1, 1, 1)
            .await
            .unwrap();
        assert_eq!(done.status, OrchestrationStatus::Failed);
        assert_eq!(done.completed_tasks + done.failed_tasks + done.skipped_tasks, 3);
        assert!(done.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_list_with_status_filter() {
        let store = store().await;
        let a = store.create(1).await.unwrap();
        let _b = store.create(1).await.unwrap();
        store
            .update_status(a.id, OrchestrationStatus::Running)
            .await
            .unwrap();

        let running = store
            .list(Some(OrchestrationStatus::Running), 100)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let all = store.list(None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
