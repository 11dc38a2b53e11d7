//! Pure functions that turn stream content blocks into one-line,
//! human-readable log summaries.

use crate::domain::models::{AgentMessage, ContentBlock};

const PREVIEW_LEN: usize = 100;

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_LEN {
        let cut: String = text.chars().take(PREVIEW_LEN).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Transform a content block into a log line. Returns `None` for blocks
/// that should not be logged.
pub fn format_content_block(block: &ContentBlock) -> Option<String> {
    match block {
        ContentBlock::ToolUse { name, input } => Some(format_tool_use(name, input)),
        ContentBlock::Thinking { thinking } => Some(format!("[thinking] {}", preview(thinking))),
        ContentBlock::Text { text } => Some(format!("[text] {}", preview(text))),
        ContentBlock::ToolResult {
            tool_use_id,
            is_error,
        } => {
            if *is_error {
                Some(format!("[tool:result:error] Tool {tool_use_id} failed"))
            } else {
                Some(format!("[tool:result:success] Tool {tool_use_id} completed"))
            }
        }
    }
}

/// Summarize a tool invocation by its name and most prominent input field.
pub fn format_tool_use(name: &str, input: &serde_json::Value) -> String {
    let field = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("N/A")
            .to_string()
    };

    match name {
        "Bash" => format!("[tool:bash] {}", field("command")),
        "Edit" | "MultiEdit" => format!("[tool:edit] {}", field("file_path")),
        "Write" => format!("[tool:write] {}", field("file_path")),
        "Read" => format!("[tool:read] {}", field("file_path")),
        "Grep" => format!("[tool:grep] {}", field("pattern")),
        "Glob" => format!("[tool:glob] {}", field("pattern")),
        "LS" => format!("[tool:ls] {}", field("path")),
        "WebSearch" => format!("[tool:websearch] {}", field("query")),
        "WebFetch" => format!("[tool:webfetch] {}", field("url")),
        "TodoWrite" => {
            let count = input
                .get("todos")
                .and_then(|t| t.as_array())
                .map(Vec::len)
                .unwrap_or(0);
            format!("[tool:todo] Managing {count} tasks")
        }
        "Task" => format!("[tool:task] {}", field("description")),
        other => {
            let raw = input.to_string();
            format!("[tool:{other}] {}", preview(&raw))
        }
    }
}

/// Summarize a message: the first significant content block wins.
pub fn summarize_message(message: &AgentMessage) -> Option<String> {
    message.content.iter().find_map(format_content_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bash_summary() {
        let line = format_tool_use("Bash", &json!({"command": "echo hi"}));
        assert_eq!(line, "[tool:bash] echo hi");
    }

    #[test]
    fn test_edit_and_write_use_file_path() {
        assert_eq!(
            format_tool_use("Edit", &json!({"file_path": "/a/b.rs"})),
            "[tool:edit] /a/b.rs"
        );
        assert_eq!(
            format_tool_use("Write", &json!({"file_path": "/a/b.rs"})),
            "[tool:write] /a/b.rs"
        );
    }

    #[test]
    fn test_unknown_tool_falls_back_to_raw_input() {
        let line = format_tool_use("Custom", &json!({"x": 1}));
        assert!(line.starts_with("[tool:Custom]"));
    }

    #[test]
    fn test_text_preview_truncates() {
        let long = "a".repeat(150);
        let line = format_content_block(&ContentBlock::Text { text: long }).unwrap();
        assert!(line.starts_with("[text] "));
        assert!(line.ends_with("..."));
        assert!(line.len() < 120);
    }

    #[test]
    fn test_tool_result_lines() {
        let ok = format_content_block(&ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            is_error: false,
        })
        .unwrap();
        assert_eq!(ok, "[tool:result:success] Tool t1 completed");

        let bad = format_content_block(&ContentBlock::ToolResult {
            tool_use_id: "t2".into(),
            is_error: true,
        })
        .unwrap();
        assert_eq!(bad, "[tool:result:error] Tool t2 failed");
    }

    #[test]
    fn test_summarize_takes_first_significant_block() {
        let message = AgentMessage::assistant(vec![
            ContentBlock::ToolUse {
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            },
            ContentBlock::Text {
                text: "listing".into(),
            },
        ]);
        assert_eq!(summarize_message(&message).unwrap(), "[tool:bash] ls");

        let empty = AgentMessage::system("result");
        assert!(summarize_message(&empty).is_none());
    }
}
