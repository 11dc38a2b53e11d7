//! Process registry entry types.
//!
//! The registry is the persistent map of every OS process the system has
//! spawned: the server itself, task runners, and the agent CLI children
//! they launch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of process an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Task,
}

/// Lifecycle state of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Alive at the moment the entry was written.
    Running,
    /// Exited normally and was reaped by its owner.
    Completed,
    /// Killed during orphan cleanup.
    Terminated,
    /// Found dead during a sweep without a recorded exit.
    Dead,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Dead => "dead",
        }
    }
}

/// One registry entry, keyed by pid in the persisted file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub kind: ProcessKind,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub status: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Server entries: the bound port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Task entries: the task id, the spawning server pid, and any agent
    /// CLI children observed for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_pids: Vec<i32>,
}

impl ProcessEntry {
    pub fn server(pid: i32, port: u16) -> Self {
        Self {
            kind: ProcessKind::Server,
            pid,
            started_at: Utc::now(),
            status: ProcessState::Running,
            ended_at: None,
            port: Some(port),
            task_id: None,
            parent_pid: None,
            child_pids: Vec::new(),
        }
    }

    pub fn task(task_id: i64, pid: i32, parent_pid: i32) -> Self {
        Self {
            kind: ProcessKind::Task,
            pid,
            started_at: Utc::now(),
            status: ProcessState::Running,
            ended_at: None,
            port: None,
            task_id: Some(task_id),
            parent_pid: Some(parent_pid),
            child_pids: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: ProcessState) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}
