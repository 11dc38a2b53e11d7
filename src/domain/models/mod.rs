//! Domain models: the data contracts shared across the system.

pub mod agent;
pub mod config;
pub mod orchestration;
pub mod process;
pub mod task;

pub use agent::{AgentMessage, AgentRequest, ContentBlock, PermissionMode};
pub use config::{Config, DatabaseConfig, ResourceConfig, RetrySettings, ServerConfig, TaskConfig};
pub use orchestration::{
    Orchestration, OrchestrationItem, OrchestrationStatus, MAX_INITIAL_DELAY,
};
pub use process::{ProcessEntry, ProcessKind, ProcessState};
pub use task::{ClaudeModel, NewTask, Task, TaskStatus, DEFAULT_SYSTEM_PROMPT};
