//! Orchestration domain model.
//!
//! An orchestration is a DAG of tasks: nodes are DAG-local identifiers,
//! edges are "must complete before". The container row aggregates
//! completion counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::ClaudeModel;

/// Status of an orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for OrchestrationStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OrchestrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a cancel request is valid from this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// A persisted orchestration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: i64,
    pub status: OrchestrationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
}

/// Maximum post-dependency delay, in seconds.
pub const MAX_INITIAL_DELAY: f64 = 3600.0;

/// One task definition inside an orchestration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationItem {
    pub identifier: String,
    pub execution_prompt: String,
    pub working_directory: String,
    pub system_prompt: Option<String>,
    pub model: Option<ClaudeModel>,
    pub depends_on: Option<Vec<String>>,
    pub initial_delay: Option<f64>,
}

impl OrchestrationItem {
    /// Validate the DAG-local identifier: `[A-Za-z0-9_-]`, 1-100 chars.
    pub fn validate_identifier(identifier: &str) -> Result<(), String> {
        if identifier.is_empty() || identifier.len() > 100 {
            return Err("Identifier must be between 1 and 100 characters".to_string());
        }
        if !identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(
                "Identifier can only contain letters, numbers, underscore, and hyphen".to_string(),
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        Self::validate_identifier(&self.identifier)?;
        if self.execution_prompt.trim().len() < 10 {
            return Err(format!(
                "Task '{}': execution prompt must be at least 10 characters",
                self.identifier
            ));
        }
        if self.working_directory.trim().is_empty() {
            return Err(format!(
                "Task '{}': working directory cannot be empty",
                self.identifier
            ));
        }
        if let Some(delay) = self.initial_delay {
            if !(0.0..=MAX_INITIAL_DELAY).contains(&delay) {
                return Err(format!(
                    "Task '{}': initial_delay must be between 0 and {} seconds",
                    self.identifier, MAX_INITIAL_DELAY
                ));
            }
        }
        Ok(())
    }
}

/// Validate a full orchestration request: non-empty, per-item rules,
/// unique identifiers. Reference and cycle checks happen against the
/// assembled graph in the orchestrator.
pub fn validate_items(items: &[OrchestrationItem]) -> Result<(), String> {
    if items.is_empty() {
        return Err("At least one task is required".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for item in items {
        item.validate()?;
        if !seen.insert(item.identifier.as_str()) {
            return Err(format!("Duplicate task identifier '{}'", item.identifier));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(identifier: &str) -> OrchestrationItem {
        OrchestrationItem {
            identifier: identifier.to_string(),
            execution_prompt: "do something useful here".to_string(),
            working_directory: "/tmp".to_string(),
            system_prompt: None,
            model: None,
            depends_on: None,
            initial_delay: None,
        }
    }

    #[test]
    fn test_identifier_charset() {
        assert!(OrchestrationItem::validate_identifier("build-step_1").is_ok());
        assert!(OrchestrationItem::validate_identifier("").is_err());
        assert!(OrchestrationItem::validate_identifier("has space").is_err());
        assert!(OrchestrationItem::validate_identifier("dot.name").is_err());
        assert!(OrchestrationItem::validate_identifier(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_delay_bounds() {
        let mut it = item("a");
        it.initial_delay = Some(0.5);
        assert!(it.validate().is_ok());
        it.initial_delay = Some(3600.0);
        assert!(it.validate().is_ok());
        it.initial_delay = Some(3600.1);
        assert!(it.validate().is_err());
        it.initial_delay = Some(-1.0);
        assert!(it.validate().is_err());
    }

    #[test]
    fn test_items_validation() {
        assert!(validate_items(&[]).is_err());
        assert!(validate_items(&[item("a"), item("b")]).is_ok());
        assert!(validate_items(&[item("a"), item("a")]).is_err());
    }

    #[test]
    fn test_cancel_only_from_active() {
        assert!(OrchestrationStatus::Pending.can_cancel());
        assert!(OrchestrationStatus::Running.can_cancel());
        assert!(!OrchestrationStatus::Completed.can_cancel());
        assert!(!OrchestrationStatus::Failed.can_cancel());
        assert!(!OrchestrationStatus::Cancelled.can_cancel());
    }
}
