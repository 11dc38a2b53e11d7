//! Persistent process registry.
//!
//! Tracks every process the system spawns across restarts. Anything that
//! spawns registers before or immediately after the spawn; recovery reads
//! the registry to reconcile reality after a crash.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::models::{ProcessEntry, ProcessKind, ProcessState};

use super::probe;

const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// An orphan found during a sweep.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub pid: i32,
    pub task_id: Option<i64>,
    /// The registry key whose entry should be updated after the kill.
    pub entry_pid: i32,
}

/// JSON-file backed registry of spawned processes, keyed by pid.
pub struct ProcessRegistry {
    path: PathBuf,
    entries: Mutex<HashMap<i32, ProcessEntry>>,
}

impl ProcessRegistry {
    pub fn new(path: PathBuf) -> Self {
        let entries = Self::load(&path);
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "loaded process registry entries");
        }
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn load(path: &Path) -> HashMap<i32, ProcessEntry> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return HashMap::new();
        };
        match serde_json::from_str::<HashMap<String, ProcessEntry>>(&raw) {
            Ok(map) => map
                .into_iter()
                .filter_map(|(key, entry)| key.parse::<i32>().ok().map(|pid| (pid, entry)))
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "failed to load process registry, starting fresh");
                HashMap::new()
            }
        }
    }

    fn save(&self, entries: &HashMap<i32, ProcessEntry>) {
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let map: HashMap<String, &ProcessEntry> =
                entries.iter().map(|(pid, e)| (pid.to_string(), e)).collect();
            let data = serde_json::to_string_pretty(&map)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let tmp = self.path.with_extension("tmp");
            std::fs::write(&tmp, data)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist process registry");
        }
    }

    /// Register the running server process.
    pub async fn register_server(&self, port: u16) {
        let pid = std::process::id() as i32;
        let mut entries = self.entries.lock().await;
        entries.insert(pid, ProcessEntry::server(pid, port));
        self.save(&entries);
        tracing::info!(pid, port, "registered server process");
    }

    /// Register a task runner process.
    pub async fn register_task(&self, task_id: i64, task_pid: i32) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            task_pid,
            ProcessEntry::task(task_id, task_pid, std::process::id() as i32),
        );
        self.save(&entries);
        tracing::info!(task_id, pid = task_pid, "registered task process");
    }

    /// Record an agent CLI child spawned for a task.
    pub async fn record_child(&self, task_id: i64, child_pid: i32) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .values_mut()
            .find(|e| e.kind == ProcessKind::Task && e.task_id == Some(task_id));
        if let Some(entry) = entry {
            if !entry.child_pids.contains(&child_pid) {
                entry.child_pids.push(child_pid);
                self.save(&entries);
                tracing::info!(task_id, child_pid, "registered agent subprocess");
            }
        } else {
            tracing::warn!(task_id, "no registry entry for task when recording child");
        }
    }

    /// Mark a task's entry completed.
    pub async fn mark_task_completed(&self, task_id: i64) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .values_mut()
            .find(|e| e.kind == ProcessKind::Task && e.task_id == Some(task_id));
        if let Some(entry) = entry {
            entry.finish(ProcessState::Completed);
            self.save(&entries);
        }
    }

    /// Mark this server's entry completed on clean shutdown.
    pub async fn mark_server_stopped(&self) {
        let pid = std::process::id() as i32;
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&pid) {
            entry.finish(ProcessState::Completed);
            self.save(&entries);
        }
    }

    /// Registry entries for tasks recorded as running.
    pub async fn running_tasks(&self) -> Vec<ProcessEntry> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| e.kind == ProcessKind::Task && e.status == ProcessState::Running)
            .cloned()
            .collect()
    }

    /// The registry entry for a task, if any.
    pub async fn task_entry(&self, task_id: i64) -> Option<ProcessEntry> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .find(|e| e.kind == ProcessKind::Task && e.task_id == Some(task_id))
            .cloned()
    }

    /// Detect orphans: a task process alive while its parent server is
    /// dead, or an agent child alive while its task process is dead.
    /// Entries found dead are downgraded in place.
    pub async fn find_orphans(&self) -> Vec<Orphan> {
        let mut entries = self.entries.lock().await;
        let mut orphans = Vec::new();
        let mut dirty = false;

        let pids: Vec<i32> = entries.keys().copied().collect();
        for pid in pids {
            let entry = entries.get(&pid).cloned();
            let Some(entry) = entry else { continue };
            if entry.kind != ProcessKind::Task {
                continue;
            }

            let task_alive = probe::pid_alive(pid);
            if task_alive {
                if entry.status == ProcessState::Running {
                    let parent_dead = entry
                        .parent_pid
                        .map(|p| !probe::pid_alive(p))
                        .unwrap_or(false);
                    if parent_dead && pid != std::process::id() as i32 {
                        orphans.push(Orphan {
                            pid,
                            task_id: entry.task_id,
                            entry_pid: pid,
                        });
                    }
                }
            } else {
                if entry.status == ProcessState::Running {
                    if let Some(e) = entries.get_mut(&pid) {
                        e.finish(ProcessState::Dead);
                        dirty = true;
                    }
                }
                // The task process is gone; any live agent child it left
                // behind is an orphan.
                for child_pid in &entry.child_pids {
                    if probe::pid_alive(*child_pid) {
                        orphans.push(Orphan {
                            pid: *child_pid,
                            task_id: entry.task_id,
                            entry_pid: pid,
                        });
                    }
                }
            }
        }

        if dirty {
            self.save(&entries);
        }
        orphans
    }

    /// Kill orphans with SIGTERM then SIGKILL and update their entries.
    /// Returns the number of processes terminated.
    pub async fn cleanup_orphans(&self) -> usize {
        let orphans = self.find_orphans().await;
        let mut cleaned = 0;

        for orphan in &orphans {
            tracing::warn!(pid = orphan.pid, task_id = ?orphan.task_id, "terminating orphaned process");
            if probe::terminate_with_grace(orphan.pid, TERMINATION_GRACE).await {
                cleaned += 1;
            }
        }

        if !orphans.is_empty() {
            let mut entries = self.entries.lock().await;
            for orphan in &orphans {
                if let Some(entry) = entries.get_mut(&orphan.entry_pid) {
                    entry.finish(ProcessState::Terminated);
                }
            }
            self.save(&entries);
        }
        cleaned
    }

    /// Remove non-running entries older than `max_age_days`.
    pub async fn cleanup_old_entries(&self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.status == ProcessState::Running || entry.started_at >= cutoff
        });
        let removed = before - entries.len();
        if removed > 0 {
            self.save(&entries);
            tracing::info!(removed, "removed old process registry entries");
        }
        removed
    }

    /// Whether a live server of ours is registered on the port.
    pub async fn is_server_running(&self, port: u16) -> bool {
        let mut entries = self.entries.lock().await;
        let mut dirty = false;
        let mut running = false;

        for entry in entries.values_mut() {
            if entry.kind == ProcessKind::Server
                && entry.port == Some(port)
                && entry.status == ProcessState::Running
            {
                if probe::pid_alive(entry.pid) && probe::is_our_process(entry.pid) {
                    running = true;
                } else {
                    entry.finish(ProcessState::Dead);
                    dirty = true;
                }
            }
        }
        if dirty {
            self.save(&entries);
        }
        running
    }
}
