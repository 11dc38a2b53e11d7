//! Per-task structured logging.
//!
//! Each task owns two files: the summary log (written through the store's
//! `append_progress`, one line per action) and a detailed log carrying
//! attempt headers, tool inputs, timestamps, and full error diagnostics.
//! A global append-only events log records one line per lifecycle event
//! across all tasks.
//!
//! Loggers are resources scoped to one task: `close` must run on every
//! exit path so file handles never leak.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::errors::DomainResult;
use crate::infrastructure::paths::{log_filename, LogKind};

/// Logger owning the detailed log handle for one task.
pub struct TaskLogger {
    task_id: i64,
    detailed: Option<File>,
    detailed_path: PathBuf,
    events_path: PathBuf,
}

impl TaskLogger {
    /// Open the detailed log for a task under `task_log_dir`.
    pub fn create(
        task_id: i64,
        working_directory: &str,
        task_log_dir: &Path,
        events_path: PathBuf,
    ) -> DomainResult<Self> {
        std::fs::create_dir_all(task_log_dir)?;
        let filename = log_filename(task_id, working_directory, LogKind::Detailed, Utc::now());
        let detailed_path = task_log_dir.join(filename);
        let detailed = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&detailed_path)?;

        Ok(Self {
            task_id,
            detailed: Some(detailed),
            detailed_path,
            events_path,
        })
    }

    pub fn detailed_path(&self) -> &Path {
        &self.detailed_path
    }

    fn write_detailed(&mut self, label: &str, message: &str) {
        if let Some(file) = self.detailed.as_mut() {
            let _ = writeln!(file, "[{}] [{label}] {message}", Utc::now().to_rfc3339());
        }
    }

    /// One line in the global events log, shared across all tasks.
    pub fn event(&self, event: &str) {
        if let Some(parent) = self.events_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
        {
            let _ = writeln!(
                file,
                "{} | task {} | {event}",
                Utc::now().to_rfc3339(),
                self.task_id
            );
        }
    }

    pub fn log_start(&mut self, execution_prompt: &str, model: &str, timeout_seconds: u64) {
        self.write_detailed("START", &format!("model={model} timeout={timeout_seconds}s"));
        self.write_detailed("PROMPT", execution_prompt);
        self.event("started");
    }

    pub fn log_message(&mut self, ordinal: u64, kind: &str) {
        self.write_detailed("MESSAGE", &format!("#{ordinal} {kind}"));
    }

    pub fn log_tool(&mut self, tool_name: &str, input: &serde_json::Value) {
        self.write_detailed("TOOL", &format!("{tool_name} {input}"));
    }

    pub fn log_progress(&mut self, message: &str, label: &str) {
        self.write_detailed(label, message);
    }

    pub fn log_retry(&mut self, attempt: u32, max_attempts: u32, error: &str, delay_secs: f64) {
        self.write_detailed(
            "RETRY",
            &format!("attempt {attempt}/{max_attempts} failed: {error}; waiting {delay_secs:.1}s"),
        );
        self.event(&format!("retry attempt {attempt}"));
    }

    /// Full failure record: message, recovery suggestions, diagnostics.
    pub fn log_error(&mut self, rendered: &str, suggestions: &[&str], diagnostics: &[String]) {
        self.write_detailed("ERROR", rendered);
        for (i, suggestion) in suggestions.iter().enumerate() {
            self.write_detailed("RECOVERY", &format!("{}. {suggestion}", i + 1));
        }
        for probe in diagnostics {
            self.write_detailed("DIAGNOSTIC", probe);
        }
    }

    pub fn log_completion(&mut self, success: bool, message: &str, duration_secs: f64) {
        let label = if success { "COMPLETED" } else { "FAILED" };
        self.write_detailed(label, &format!("{message} ({duration_secs:.1}s)"));
        self.event(if success { "completed" } else { "failed" });
    }

    /// Flush and drop the file handle. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut file) = self.detailed.take() {
            let _ = file.flush();
        }
    }
}

impl Drop for TaskLogger {
    fn drop(&mut self) {
        self.close();
    }
}
