//! Claude Code CLI runtime implementation.
//!
//! Spawns the `claude` CLI for one task attempt and translates its
//! stream-JSON stdout into agent messages. The child runs in its own
//! process group so it survives a server crash; recovery reclaims it by
//! the entrypoint environment marker.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::domain::models::{AgentMessage, AgentRequest, ContentBlock};
use crate::domain::ports::{AgentRuntime, AgentStream};

use super::errors::AgentError;

/// Environment marker identifying processes spawned by this system. The
/// process registry and recovery both key off it.
pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";
pub const ENTRYPOINT_VALUE: &str = "claude-cto";
pub const TASK_ID_ENV: &str = "CLAUDE_CTO_TASK_ID";

/// Claude Code CLI runtime configuration.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    /// Path to the claude CLI binary.
    pub binary_path: String,
    /// Additional CLI flags appended to every invocation.
    pub extra_flags: Vec<String>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            extra_flags: vec![],
        }
    }
}

/// Claude Code CLI runtime.
pub struct ClaudeCodeRuntime {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeRuntime {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    /// Build CLI arguments for a request.
    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            request.model.as_str().to_string(),
            "--permission-mode".to_string(),
            request.permission_mode.as_str().to_string(),
            "--system-prompt".to_string(),
            request.system_prompt.clone(),
        ];

        args.extend(self.config.extra_flags.clone());

        args.push("-p".to_string());
        args.push(request.execution_prompt.clone());

        args
    }

    /// Parse one stream line.
    ///
    /// JSON objects carry a `type` discriminator; assistant messages hold
    /// content blocks either flat or nested under `message.content`.
    /// Plain non-JSON text is folded into a text message. A line that
    /// looks like JSON but fails to parse is a decode error.
    fn parse_line(line: &str) -> Option<Result<AgentMessage, AgentError>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.starts_with('{') {
            let json: serde_json::Value = match serde_json::from_str(trimmed) {
                Ok(json) => json,
                Err(e) => {
                    return Some(Err(AgentError::StreamDecode {
                        line: trimmed.chars().take(500).collect(),
                        cause: e.to_string(),
                    }))
                }
            };

            let Some(kind) = json.get("type").and_then(|t| t.as_str()) else {
                return Some(Err(AgentError::MessageParse(format!(
                    "message without type tag: {}",
                    trimmed.chars().take(100).collect::<String>()
                ))));
            };

            if kind == "assistant" {
                let blocks = json
                    .get("content")
                    .or_else(|| json.get("message").and_then(|m| m.get("content")))
                    .and_then(|c| c.as_array())
                    .map(|items| items.iter().filter_map(parse_block).collect())
                    .unwrap_or_default();
                return Some(Ok(AgentMessage::assistant(blocks)));
            }

            if kind == "error" {
                let message = json
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown runtime error");
                return Some(Err(classify_reported_error(message)));
            }

            return Some(Ok(AgentMessage::system(kind)));
        }

        // Plain text output.
        Some(Ok(AgentMessage::assistant(vec![ContentBlock::Text {
            text: trimmed.to_string(),
        }])))
    }
}

fn parse_block(value: &serde_json::Value) -> Option<ContentBlock> {
    let kind = value.get("type").and_then(|t| t.as_str())?;
    match kind {
        "tool_use" => Some(ContentBlock::ToolUse {
            name: value
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown")
                .to_string(),
            input: value.get("input").cloned().unwrap_or(serde_json::Value::Null),
        }),
        "text" => Some(ContentBlock::Text {
            text: value
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: value
                .get("tool_use_id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(|e| e.as_bool())
                .unwrap_or(false),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            thinking: value
                .get("thinking")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}

/// Map an error reported on the stream to the taxonomy.
fn classify_reported_error(message: &str) -> AgentError {
    let lowered = message.to_lowercase();
    if lowered.contains("rate limit") || lowered.contains("429") {
        AgentError::RateLimited(message.to_string())
    } else if lowered.contains("connection") || lowered.contains("network") {
        AgentError::Connection(message.to_string())
    } else {
        AgentError::Other(message.to_string())
    }
}

/// Classify a child exit into the error taxonomy.
fn classify_exit(exit_code: Option<i32>, stderr: String) -> AgentError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("rate limit") || lowered.contains("429") {
        return AgentError::RateLimited(stderr);
    }
    if exit_code == Some(127) {
        return AgentError::CliNotFound { path: None };
    }
    AgentError::Process { exit_code, stderr }
}

#[async_trait]
impl AgentRuntime for ClaudeCodeRuntime {
    fn name(&self) -> &'static str {
        "claude_code"
    }

    async fn probe(&self) -> Result<bool, AgentError> {
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(&self.config.binary_path)
                .arg("--version")
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output.status.success()),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    async fn start(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        let args = self.build_args(&request);

        let mut cmd = if cfg!(unix) {
            if let Some(limit_mb) = request.memory_limit_mb {
                // Apply the memory ceiling through the shell; "$@" keeps
                // prompt arguments intact without shell interpolation.
                let limit_kb = limit_mb * 1024;
                let mut cmd = Command::new("bash");
                cmd.arg("-c")
                    .arg(format!("ulimit -v {limit_kb}; exec \"$@\""))
                    .arg("bash")
                    .arg(&self.config.binary_path)
                    .args(&args);
                cmd
            } else {
                let mut cmd = Command::new(&self.config.binary_path);
                cmd.args(&args);
                cmd
            }
        } else {
            let mut cmd = Command::new(&self.config.binary_path);
            cmd.args(&args);
            cmd
        };

        cmd.current_dir(&request.cwd)
            .env(ENTRYPOINT_ENV, ENTRYPOINT_VALUE)
            .env(TASK_ID_ENV, request.task_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        // New process group: the child must not receive the server's
        // signals and is expected to outlive a server crash.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::CliNotFound {
                    path: Some(self.config.binary_path.clone()),
                }
            } else {
                AgentError::Connection(format!("Failed to spawn claude: {e}"))
            }
        })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Connection("Failed to capture stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Connection("Failed to capture stderr".to_string()))?;

        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut stderr_buf = String::new();
            let stderr_task = tokio::spawn(async move {
                let _ = stderr.read_to_string(&mut stderr_buf).await;
                stderr_buf
            });

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(parsed) = Self::parse_line(&line) {
                    let failed = parsed.is_err();
                    if tx.send(parsed).await.is_err() || failed {
                        break;
                    }
                }
            }

            let status = child.wait().await;
            let stderr_text = stderr_task.await.unwrap_or_default();

            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = tx
                        .send(Err(classify_exit(status.code(), stderr_text)))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(AgentError::Connection(format!(
                            "Failed to reap claude process: {e}"
                        ))))
                        .await;
                }
            }
        });

        Ok(AgentStream { messages: rx, pid })
    }
}

/// Best-effort environment probes attached to failure reports in the
/// detailed log: binary presence, node presence, and auth status.
pub async fn diagnostics(binary_path: &str) -> Vec<String> {
    let mut probes = Vec::new();

    probes.push(format!(
        "claude binary in PATH: {}",
        find_in_path(binary_path).is_some()
    ));
    probes.push(format!("node in PATH: {}", find_in_path("node").is_some()));

    let auth = tokio::time::timeout(
        Duration::from_secs(2),
        Command::new(binary_path)
            .args(["auth", "status"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await;
    let auth_status = match auth {
        Ok(Ok(output)) if output.status.success() => "authenticated",
        Ok(Ok(_)) => "not authenticated",
        Ok(Err(_)) => "claude CLI not found",
        Err(_) => "unable to check",
    };
    probes.push(format!("auth status: {auth_status}"));

    probes
}

/// Look up an executable on PATH.
pub fn find_in_path(name: &str) -> Option<std::path::PathBuf> {
    let path = std::path::Path::new(name);
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ClaudeModel;

    #[test]
    fn test_build_args() {
        let runtime = ClaudeCodeRuntime::new(ClaudeCodeConfig::default());
        let request = AgentRequest::new(1, "/tmp")
            .with_prompts("be helpful", "do the thing")
            .with_model(ClaudeModel::Opus);

        let args = runtime.build_args(&request);
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"opus".to_string()));
        assert!(args.contains(&"bypassPermissions".to_string()));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn test_parse_assistant_line() {
        let line = r#"{"type":"assistant","content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}"#;
        let message = ClaudeCodeRuntime::parse_line(line).unwrap().unwrap();
        assert_eq!(message.kind, "assistant");
        assert_eq!(message.content.len(), 1);
        assert!(matches!(
            &message.content[0],
            ContentBlock::ToolUse { name, .. } if name == "Bash"
        ));
    }

    #[test]
    fn test_parse_nested_content() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let message = ClaudeCodeRuntime::parse_line(line).unwrap().unwrap();
        assert_eq!(message.content.len(), 1);
    }

    #[test]
    fn test_parse_plain_text_and_blank() {
        assert!(ClaudeCodeRuntime::parse_line("").is_none());
        let message = ClaudeCodeRuntime::parse_line("hello").unwrap().unwrap();
        assert!(matches!(&message.content[0], ContentBlock::Text { text } if text == "hello"));
    }

    #[test]
    fn test_parse_malformed_json_is_decode_error() {
        let result = ClaudeCodeRuntime::parse_line(r#"{"type": "assist"#).unwrap();
        assert!(matches!(result, Err(AgentError::StreamDecode { .. })));
    }

    #[test]
    fn test_parse_error_line() {
        let line = r#"{"type":"error","message":"rate limit exceeded"}"#;
        let result = ClaudeCodeRuntime::parse_line(line).unwrap();
        assert!(matches!(result, Err(AgentError::RateLimited(_))));
    }

    #[test]
    fn test_classify_exit() {
        assert!(matches!(
            classify_exit(Some(127), String::new()),
            AgentError::CliNotFound { .. }
        ));
        assert!(matches!(
            classify_exit(Some(1), "rate limit hit".to_string()),
            AgentError::RateLimited(_)
        ));
        assert!(matches!(
            classify_exit(Some(137), String::new()),
            AgentError::Process { .. }
        ));
    }
}
