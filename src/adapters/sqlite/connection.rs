//! Tasks database: path resolution, connection policy, and pool setup.
//!
//! One pool per process; every logical operation borrows a connection for
//! its own duration and nothing holds one across requests. WAL mode keeps
//! the hot `append_progress` write path from blocking API readers, and
//! the 30s busy timeout covers contention between the server loop and
//! isolated runners sharing the same database file.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::models::DatabaseConfig;
use crate::infrastructure::paths::app_dir;

use super::migrations::{migrate_to_latest, MigrationError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Invalid database path: {0}")]
    InvalidPath(String),
    #[error("Failed to create database directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),
    #[error("Failed to open database: {0}")]
    OpenFailed(#[source] sqlx::Error),
    #[error(transparent)]
    MigrationFailed(#[from] MigrationError),
}

/// Resolve the tasks database file.
///
/// Precedence: the `CLAUDE_CTO_DB` environment variable, then the
/// configured override, then `<app_dir>/tasks.db`.
pub fn database_path(config: &DatabaseConfig) -> PathBuf {
    if let Ok(path) = std::env::var("CLAUDE_CTO_DB") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    config
        .path
        .clone()
        .unwrap_or_else(|| app_dir().join("tasks.db"))
}

/// Open the tasks database and bring its schema to the latest version.
///
/// Creates the parent directory and the file on first use. The returned
/// pool is sized from the configuration and ready for the stores.
pub async fn open_task_db(config: &DatabaseConfig) -> Result<SqlitePool, DatabaseError> {
    let path = database_path(config);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(DatabaseError::DirectoryCreationFailed)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(DatabaseError::OpenFailed)?;

    migrate_to_latest(&pool).await?;
    tracing::info!(path = %path.display(), "tasks database ready");
    Ok(pool)
}

/// Raw in-memory database with no schema applied. Migration tests start
/// from this; everything else wants [`open_test_db`].
pub async fn connect_in_memory() -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|_| DatabaseError::InvalidPath("sqlite::memory:".to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .shared_cache(true);

    // Single connection so every statement sees the same database.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(DatabaseError::OpenFailed)
}

/// In-memory database at the latest schema version, for tests.
pub async fn open_test_db() -> Result<SqlitePool, DatabaseError> {
    let pool = connect_in_memory().await?;
    migrate_to_latest(&pool).await?;
    Ok(pool)
}
