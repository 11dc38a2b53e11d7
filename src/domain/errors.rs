//! Domain errors for the claude-cto server.

use thiserror::Error;

/// Domain-level errors that can occur across the task engine.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Orchestration not found: {0}")]
    OrchestrationNotFound(i64),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Circular dependency detected involving task '{0}'")]
    CycleDetected(String),

    #[error("Task '{task}' depends on non-existent task '{dependency}'")]
    InvalidDependency { task: String, dependency: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Too many concurrent tasks ({running}/{limit})")]
    AdmissionRefused { running: usize, limit: usize },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::IoError(err.to_string())
    }
}
