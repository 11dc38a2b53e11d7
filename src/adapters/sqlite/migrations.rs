//! SQLite database migration management.
//!
//! The hard-coded migration list is the single source of truth for the
//! schema. Migrations are immutable once released; each one is applied in
//! a transaction together with its version-row insert.

use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to execute migration {version}: {source}")]
    ExecutionError {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("Failed to get schema version: {0}")]
    VersionCheckError(#[source] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply every pending migration in strictly increasing version order.
    /// Returns how many were applied. Running twice is a no-op.
    pub async fn run_embedded_migrations(
        &self,
        migrations: &[Migration],
    ) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;
        let current_version = self.get_current_version().await?;
        let mut pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| m.version > current_version)
            .collect();
        pending.sort_by_key(|m| m.version);

        for migration in &pending {
            self.apply_migration(migration).await?;
        }

        Ok(pending.len())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MigrationError::ExecutionError {
            version: 0,
            source: e,
        })?;
        Ok(())
    }

    pub async fn get_current_version(&self) -> Result<i64, MigrationError> {
        let result: Option<(i64,)> =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_optional(&self.pool)
                .await
                .map_err(MigrationError::VersionCheckError)?;
        Ok(result.map(|(v,)| v).unwrap_or(0))
    }

    /// One transaction per migration: the DDL and the version-row insert
    /// commit together or not at all.
    async fn apply_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrationError::ExecutionError {
                version: migration.version,
                source: e,
            })?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::ExecutionError {
                version: migration.version,
                source: e,
            })?;

        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::ExecutionError {
                version: migration.version,
                source: e,
            })?;

        tx.commit().await.map_err(|e| MigrationError::ExecutionError {
            version: migration.version,
            source: e,
        })?;

        Ok(())
    }
}

pub fn all_embedded_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema",
            sql: include_str!("../../../migrations/001_initial_schema.sql"),
        },
        Migration {
            version: 2,
            description: "Orchestrations",
            sql: include_str!("../../../migrations/002_orchestrations.sql"),
        },
    ]
}

/// Create a fresh pool-backed schema at the latest version.
pub async fn migrate_to_latest(pool: &SqlitePool) -> Result<usize, MigrationError> {
    Migrator::new(pool.clone())
        .run_embedded_migrations(&all_embedded_migrations())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::connect_in_memory;

    #[tokio::test]
    async fn test_fresh_database_reaches_latest_version() {
        let pool = connect_in_memory().await.unwrap();
        let applied = migrate_to_latest(&pool).await.unwrap();
        assert_eq!(applied, all_embedded_migrations().len());

        let migrator = Migrator::new(pool.clone());
        let version = migrator.get_current_version().await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        migrate_to_latest(&pool).await.unwrap();
        let second_run = migrate_to_latest(&pool).await.unwrap();
        assert_eq!(second_run, 0);
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let migrations = all_embedded_migrations();
        for pair in migrations.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
