//! Cross-platform path utilities: app directory resolution and safe,
//! unique log filenames derived from task id and working directory.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Resolve the application data directory (`~/.claude-cto` by default).
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".claude-cto")
}

/// Resolve the log root directory, honoring `CLAUDE_CTO_LOG_DIR`.
pub fn log_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CLAUDE_CTO_LOG_DIR") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    app_dir().join("logs")
}

/// Directory for per-task logs under the log root.
pub fn task_log_dir() -> PathBuf {
    log_dir().join("tasks")
}

/// Directory for isolated-runner artifacts.
pub fn runner_dir() -> PathBuf {
    app_dir().join("runners")
}

/// Directory for isolated-runner subprocess logs.
pub fn runner_log_dir() -> PathBuf {
    log_dir().join("runners")
}

/// The lock directory shared by all servers on the host.
pub fn lock_dir() -> PathBuf {
    std::env::temp_dir().join("claude-cto-locks")
}

/// Default length bound for a sanitized filename component.
pub const MAX_COMPONENT_LEN: usize = 50;

/// Convert an arbitrary string to a safe filename component.
///
/// Folds to ASCII, strips characters reserved on any common platform,
/// collapses separators to underscores, bounds the length, and never
/// returns an empty or dot-leading component.
pub fn sanitize_filename(raw: &str, max_length: usize) -> String {
    if raw.is_empty() {
        return "unknown".to_string();
    }

    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            ' ' | '-' | '/' | '\\' => out.push('_'),
            '@' => out.push_str("at"),
            '#' => out.push_str("hash"),
            '$' => out.push_str("dollar"),
            '%' => out.push_str("pct"),
            '&' => out.push_str("and"),
            '=' => out.push_str("eq"),
            '+' => out.push_str("plus"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            // Reserved on Windows (: * ? " < > |), shell metacharacters,
            // dots, and anything non-ASCII are dropped.
            _ => {}
        }
    }

    // Collapse runs of underscores and trim the edges.
    let mut collapsed = String::with_capacity(out.len());
    let mut last_underscore = false;
    for c in out.chars() {
        if c == '_' {
            if !last_underscore {
                collapsed.push('_');
            }
            last_underscore = true;
        } else {
            collapsed.push(c);
            last_underscore = false;
        }
    }
    let mut name: String = collapsed.trim_matches('_').to_string();

    if name.is_empty() {
        name = "unnamed".to_string();
    }
    if name.len() > max_length {
        name.truncate(max_length);
        name = name.trim_end_matches('_').to_string();
        if name.is_empty() {
            name = "unnamed".to_string();
        }
    }
    name.to_lowercase()
}

/// Generic directory names that carry no context on their own.
const GENERIC_DIR_NAMES: &[&str] = &["src", "app", "lib", "bin", "tmp", "dist", "build"];

/// Extract a meaningful filename component from a working directory.
///
/// Uses the last path segment; when that segment is short or generic, the
/// parent segment is prepended for context.
pub fn directory_context(working_directory: &str) -> String {
    let path = std::path::Path::new(working_directory);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let needs_parent = name.len() <= 2 || GENERIC_DIR_NAMES.contains(&name.to_lowercase().as_str());
    let context = if needs_parent {
        let parent = path
            .parent()
            .and_then(std::path::Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if parent.is_empty() {
            name
        } else {
            format!("{parent}_{name}")
        }
    } else {
        name
    };

    sanitize_filename(&context, 30)
}

/// Kinds of per-task log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Summary,
    Detailed,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Detailed => "detailed",
        }
    }
}

/// Build the per-task log filename:
/// `task_{id}_{sanitized_dir}_{YYYYMMDD_HHMM}_{summary|detailed}.log`.
///
/// The task id guarantees uniqueness even under rapid creation; the
/// directory context and timestamp exist for humans scanning the log dir.
pub fn log_filename(
    task_id: i64,
    working_directory: &str,
    kind: LogKind,
    timestamp: DateTime<Utc>,
) -> String {
    let context = directory_context(working_directory);
    let stamp = timestamp.format("%Y%m%d_%H%M");
    format!("task_{task_id}_{context}_{stamp}_{}.log", kind.as_str())
}
