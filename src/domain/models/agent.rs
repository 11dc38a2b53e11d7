//! Agent-runtime wire contract.
//!
//! The engine treats the Claude Code CLI as an opaque streaming RPC: a
//! request opens a lazy, finite sequence of messages, each carrying a type
//! tag and, for assistant output, a sequence of typed content blocks.

use serde::{Deserialize, Serialize};

use super::task::ClaudeModel;

/// Permission mode passed to the runtime. The server always runs with
/// permissions bypassed: the whole point of the system is to automate
/// tasks that would otherwise require interactive approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// A request to open an agent-runtime stream for one task attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: i64,
    pub cwd: String,
    pub system_prompt: String,
    pub execution_prompt: String,
    pub model: ClaudeModel,
    pub permission_mode: PermissionMode,
    /// Memory ceiling applied to the subprocess, in megabytes.
    pub memory_limit_mb: Option<u64>,
}

impl AgentRequest {
    pub fn new(task_id: i64, cwd: impl Into<String>) -> Self {
        Self {
            task_id,
            cwd: cwd.into(),
            system_prompt: String::new(),
            execution_prompt: String::new(),
            model: ClaudeModel::default(),
            permission_mode: PermissionMode::BypassPermissions,
            memory_limit_mb: None,
        }
    }

    pub fn with_prompts(
        mut self,
        system_prompt: impl Into<String>,
        execution_prompt: impl Into<String>,
    ) -> Self {
        self.system_prompt = system_prompt.into();
        self.execution_prompt = execution_prompt.into();
        self
    }

    pub fn with_model(mut self, model: ClaudeModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_memory_limit(mut self, limit_mb: Option<u64>) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }
}

/// A typed content block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
}

/// One message from the runtime stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Type discriminator as reported by the runtime (e.g. "assistant",
    /// "system", "result").
    pub kind: String,
    /// Content blocks for assistant messages; empty otherwise.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AgentMessage {
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            kind: "assistant".to_string(),
            content,
        }
    }

    pub fn system(kind_detail: &str) -> Self {
        Self {
            kind: kind_detail.to_string(),
            content: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_block_serde() {
        let block = ContentBlock::ToolUse {
            name: "Bash".to_string(),
            input: json!({"command": "echo hi"}),
        };
        let encoded = serde_json::to_string(&block).unwrap();
        let decoded: ContentBlock = serde_json::from_str(&encoded).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn test_request_builder() {
        let request = AgentRequest::new(7, "/tmp")
            .with_prompts("system", "do the thing")
            .with_model(ClaudeModel::Opus)
            .with_memory_limit(Some(4096));
        assert_eq!(request.task_id, 7);
        assert_eq!(request.model, ClaudeModel::Opus);
        assert_eq!(request.permission_mode.as_str(), "bypassPermissions");
        assert_eq!(request.memory_limit_mb, Some(4096));
    }
}
