//! Agent runtime error taxonomy.
//!
//! Every failure from the agent CLI is classified as transient (worth a
//! bounded retry) or permanent (retry is futile). Classification drives
//! the retry loop, the circuit breaker, and the user-visible message.

use thiserror::Error;

/// Exit codes that indicate the process was killed by timeout or a
/// termination signal rather than its own logic.
const SIGNAL_EXIT_CODES: &[i32] = &[124, 137, 143];

/// Stderr fragments that mark a process failure as a passing condition.
const TRANSIENT_STDERR_PATTERNS: &[&str] =
    &["timeout", "connection", "network", "rate limit", "temporary"];

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The agent CLI binary could not be found.
    #[error("Claude CLI not found{}", path_suffix(.path))]
    CliNotFound { path: Option<String> },

    /// Could not connect to the agent CLI or it dropped the connection.
    #[error("Connection to Claude CLI failed: {0}")]
    Connection(String),

    /// The CLI process exited with a failure.
    #[error("Claude CLI process failed{}", exit_suffix(.exit_code))]
    Process {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A stream line could not be decoded as JSON.
    #[error("Failed to decode stream output: {cause}")]
    StreamDecode { line: String, cause: String },

    /// A decoded message did not match the expected shape.
    #[error("Failed to parse message: {0}")]
    MessageParse(String),

    /// The API reported a rate limit.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// The per-attempt wall-clock timeout fired.
    #[error("Task exceeded {seconds}s timeout")]
    Timeout { seconds: u64 },

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

fn path_suffix(path: &Option<String>) -> String {
    path.as_ref()
        .map(|p| format!(" (searched at {p})"))
        .unwrap_or_default()
}

fn exit_suffix(exit_code: &Option<i32>) -> String {
    exit_code
        .map(|c| format!(" (exit code {c})"))
        .unwrap_or_default()
}

impl AgentError {
    /// Whether this error is worth retrying.
    ///
    /// Connection, timeout, and rate-limit shapes are transient. Process
    /// exits by signal-like codes (124/137/143) and network-shaped stderr
    /// are transient. Decode failures are transient only when caused by
    /// timeout or truncation. Everything else, including unknown errors,
    /// is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::RateLimited(_) | Self::Timeout { .. } => true,
            Self::Process { exit_code, stderr } => {
                if let Some(code) = exit_code {
                    if SIGNAL_EXIT_CODES.contains(code) {
                        return true;
                    }
                }
                let stderr = stderr.to_lowercase();
                TRANSIENT_STDERR_PATTERNS.iter().any(|p| stderr.contains(p))
            }
            Self::StreamDecode { line, cause } => {
                let cause = cause.to_lowercase();
                let line = line.to_lowercase();
                cause.contains("timeout")
                    || cause.contains("connection")
                    || line.contains("incomplete")
                    || line.contains("truncated")
            }
            Self::CliNotFound { .. } | Self::MessageParse(_) => false,
            Self::Other(message) => {
                let message = message.to_lowercase();
                ["connection", "network", "timeout", "temporary", "unavailable"]
                    .iter()
                    .any(|p| message.contains(p))
            }
        }
    }

    /// Whether the error is rate-limit shaped, for the gentler retry profile.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            other => {
                let message = other.to_string().to_lowercase();
                message.contains("rate limit") || message.contains("429")
            }
        }
    }

    /// Short stable code used as the leading tag of user-visible messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CliNotFound { .. } => "CLINotFoundError",
            Self::Connection(_) => "CLIConnectionError",
            Self::Process { .. } => "ProcessError",
            Self::StreamDecode { .. } => "CLIJSONDecodeError",
            Self::MessageParse(_) => "MessageParseError",
            Self::RateLimited(_) => "RateLimitError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Other(_) => "SDKError",
        }
    }

    /// Actionable recovery steps, most useful first.
    pub fn recovery_suggestions(&self) -> &'static [&'static str] {
        match self {
            Self::CliNotFound { .. } => &[
                "Install Claude CLI: npm install -g @anthropic-ai/claude-code",
                "Verify installation: claude --version",
                "Check PATH environment variable includes Claude CLI location",
            ],
            Self::Connection(_) => &[
                "Verify Claude CLI is working: claude --version",
                "Check if you're authenticated: claude auth status",
                "Check network connectivity and firewall settings",
            ],
            Self::Process { .. } => &["Check task logs for detailed error information"],
            Self::StreamDecode { .. } => &[
                "This may be a temporary issue - retry the task",
                "Check if Claude CLI version is up to date",
            ],
            Self::MessageParse(_) => &[
                "Update the Claude CLI and server to compatible versions",
                "Review the detailed log for the problematic message format",
            ],
            Self::RateLimited(_) => &["Wait for the rate limit window to pass before retrying"],
            Self::Timeout { .. } => &[
                "Split the task into smaller pieces",
                "Use a model with a larger timeout ceiling",
            ],
            Self::Other(_) => &[
                "Check task logs for details",
                "Retry the task",
            ],
        }
    }

    /// Render the user-visible failure message:
    /// category tag, short message, relevant detail, top suggestion.
    pub fn render(&self) -> String {
        let mut parts = vec![format!("[{}] {}", self.code(), self)];

        if let Self::Process { exit_code, stderr } = self {
            if let Some(code) = exit_code {
                parts.push(format!("meaning: {}", exit_code_meaning(*code)));
            }
            if !stderr.is_empty() {
                let preview: String = stderr.chars().take(200).collect();
                let ellipsis = if stderr.len() > 200 { "..." } else { "" };
                parts.push(format!("stderr: {preview}{ellipsis}"));
            }
        }
        if let Self::StreamDecode { line, .. } = self {
            if !line.is_empty() {
                let preview: String = line.chars().take(100).collect();
                parts.push(format!("failed to parse: {preview}..."));
            }
        }

        if let Some(suggestion) = self.recovery_suggestions().first() {
            parts.push(format!("suggestion: {suggestion}"));
        }

        parts.join(" | ")
    }
}

/// Human-readable meaning of a process exit code.
pub fn exit_code_meaning(exit_code: i32) -> String {
    match exit_code {
        0 => "Success".to_string(),
        1 => "General error".to_string(),
        2 => "Misuse of shell command".to_string(),
        124 => "Killed by timeout".to_string(),
        126 => "Command cannot execute (permission problem)".to_string(),
        127 => "Command not found".to_string(),
        128 => "Invalid exit argument".to_string(),
        130 => "Terminated by Ctrl+C".to_string(),
        255 => "Exit status out of range".to_string(),
        code if code > 128 => format!("Terminated by signal {}", code - 128),
        code => format!("Unknown exit code: {code}"),
    }
}
