//! Task domain model.
//!
//! A task is one fire-and-forget agentic job: prompt, working directory,
//! model selection, and a strict lifecycle driven by the task runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task in its lifecycle.
///
/// Standalone tasks start in `Pending`; tasks belonging to an orchestration
/// start in `Waiting` until their dependencies complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to run, runner not yet started.
    Pending,
    /// Waiting for orchestration dependencies to complete.
    Waiting,
    /// Runner is executing the task.
    Running,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: failed permanently or exhausted retries.
    Failed,
    /// Terminal: never ran because a dependency failed or was cancelled.
    Skipped,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Check if this is a terminal state. Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Valid transitions from this status.
    ///
    /// No transition ever returns to an earlier state on the lattice.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Waiting => &[Self::Pending, Self::Skipped],
            Self::Pending => &[Self::Running, Self::Skipped, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed | Self::Skipped => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Claude model selection for task execution.
///
/// Affects the per-attempt timeout ceiling only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeModel {
    Sonnet,
    Opus,
    Haiku,
}

impl Default for ClaudeModel {
    fn default() -> Self {
        Self::Sonnet
    }
}

impl ClaudeModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
            Self::Haiku => "haiku",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sonnet" => Some(Self::Sonnet),
            "opus" => Some(Self::Opus),
            "haiku" => Some(Self::Haiku),
            _ => None,
        }
    }

    /// Per-attempt wall-clock timeout ceiling in seconds.
    pub fn timeout_seconds(&self) -> u64 {
        match self {
            Self::Haiku => 600,
            Self::Sonnet => 1800,
            Self::Opus => 3600,
        }
    }
}

/// A persisted task record. Owned by the store; other components hold ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub status: TaskStatus,
    pub pid: Option<i32>,
    pub working_directory: String,
    pub system_prompt: String,
    pub execution_prompt: String,
    pub model: ClaudeModel,
    pub log_file_path: Option<String>,
    pub last_action_cache: Option<String>,
    pub final_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    // Orchestration fields; null unless the task belongs to a DAG.
    pub orchestration_id: Option<i64>,
    pub identifier: Option<String>,
    pub depends_on: Option<Vec<String>>,
    pub initial_delay: Option<f64>,
    pub dependency_failed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Dependency identifiers, empty when the task has none.
    pub fn dependencies(&self) -> &[String] {
        self.depends_on.as_deref().unwrap_or(&[])
    }
}

/// Default system prompt applied when a task creation omits one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant following John Carmack's principles of simplicity \
     and minimalism in software development.";

/// Validated input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub working_directory: String,
    pub system_prompt: String,
    pub execution_prompt: String,
    pub model: ClaudeModel,
}

impl NewTask {
    /// Validate and normalize the lenient (human-facing) input rules.
    pub fn validate(
        execution_prompt: &str,
        working_directory: &str,
        system_prompt: Option<&str>,
        model: Option<ClaudeModel>,
    ) -> Result<Self, String> {
        let execution_prompt = execution_prompt.trim();
        if execution_prompt.len() < 10 {
            return Err("Execution prompt must be at least 10 characters".to_string());
        }
        let working_directory = working_directory.replace('\\', "/").trim().to_string();
        if working_directory.is_empty() {
            return Err("Working directory cannot be empty".to_string());
        }
        if let Some(sp) = system_prompt {
            if sp.len() > 1000 {
                return Err("System prompt must be at most 1000 characters".to_string());
            }
        }
        Ok(Self {
            working_directory,
            system_prompt: system_prompt
                .map(str::to_string)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            execution_prompt: execution_prompt.to_string(),
            model: model.unwrap_or_default(),
        })
    }

    /// Validate the strict (machine-facing MCP) input rules.
    ///
    /// The "John Carmack" token check is an ecosystem validator with no
    /// effect on execution.
    pub fn validate_strict(
        execution_prompt: &str,
        working_directory: &str,
        system_prompt: &str,
        model: Option<ClaudeModel>,
    ) -> Result<Self, String> {
        if system_prompt.len() < 75 || system_prompt.len() > 500 {
            return Err("System prompt must be between 75 and 500 characters".to_string());
        }
        if !system_prompt.contains("John Carmack") {
            return Err(r#"System prompt must contain "John Carmack""#.to_string());
        }
        if execution_prompt.len() < 150 {
            return Err("Execution prompt must be at least 150 characters".to_string());
        }
        if !execution_prompt.contains('/') && !execution_prompt.contains('\\') {
            return Err("Execution prompt must contain a path-like string".to_string());
        }
        let working_directory = working_directory.replace('\\', "/").trim().to_string();
        if working_directory.is_empty() {
            return Err("Working directory cannot be empty".to_string());
        }
        Ok(Self {
            working_directory,
            system_prompt: system_prompt.to_string(),
            execution_prompt: execution_prompt.to_string(),
            model: model.unwrap_or_default(),
        })
    }
}
