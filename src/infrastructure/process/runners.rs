//! Isolated task runners.
//!
//! Optional deployment mode: each task runs in a detached subprocess
//! (`claude-cto run-task`) launched through a small shell script that
//! applies the memory ulimit. The runner survives a server crash; its
//! pid and log location are recorded in an info file for recovery and
//! admission control.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::adapters::runtime::{ENTRYPOINT_ENV, ENTRYPOINT_VALUE};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::TaskConfig;

use super::probe;

/// Metadata persisted next to each runner script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub task_id: i64,
    pub pid: u32,
    pub script_path: PathBuf,
    pub log_file: PathBuf,
}

/// Launches and tracks isolated task runners.
pub struct IsolatedRunner {
    runner_dir: PathBuf,
    log_dir: PathBuf,
}

impl IsolatedRunner {
    pub fn new(runner_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self { runner_dir, log_dir }
    }

    /// Spawn a detached runner for a task.
    ///
    /// Refuses when the running-task ceiling is reached. The subprocess
    /// gets a new session, stdio redirected to its own log file, and the
    /// entrypoint marker plus task id in its environment.
    pub async fn spawn(&self, task_id: i64, config: &TaskConfig) -> DomainResult<RunnerInfo> {
        std::fs::create_dir_all(&self.runner_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;

        self.cleanup_old_files(config.cleanup_interval_days);

        let running = self.running_tasks().len();
        if running >= config.max_concurrent_tasks {
            return Err(DomainError::AdmissionRefused {
                running,
                limit: config.max_concurrent_tasks,
            });
        }

        let script_path = self.runner_dir.join(format!("task_{task_id}_runner.sh"));
        let exe = std::env::current_exe()?;
        let memory_limit_kb = config.task_memory_limit_mb * 1024;
        let script = format!(
            "#!/usr/bin/env bash\nulimit -v {memory_limit_kb}\nexec {} run-task --task-id {task_id}\n",
            exe.display()
        );
        std::fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;
        }

        let log_file = self.log_dir.join(format!("task_{task_id}_subprocess.log"));
        let log_handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        let stderr_handle = log_handle.try_clone()?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_handle))
            .stderr(Stdio::from(stderr_handle))
            .env(ENTRYPOINT_ENV, ENTRYPOINT_VALUE)
            .env("CLAUDE_CTO_TASK_ID", task_id.to_string())
            .env("TASK_TIMEOUT", config.task_timeout_seconds.to_string())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| DomainError::ExecutionFailed(format!("failed to spawn runner: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| DomainError::ExecutionFailed("runner exited before start".into()))?;

        let info = RunnerInfo {
            task_id,
            pid,
            script_path: script_path.clone(),
            log_file,
        };
        let info_path = self.info_path(task_id);
        std::fs::write(&info_path, serde_json::to_string_pretty(&info)?)?;

        tracing::info!(task_id, pid, "started isolated task runner");
        Ok(info)
    }

    fn info_path(&self, task_id: i64) -> PathBuf {
        self.runner_dir.join(format!("task_{task_id}_info.json"))
    }

    /// Live runners, determined from info files with a liveness probe.
    /// Dead runners' info files are removed as they are found.
    pub fn running_tasks(&self) -> Vec<RunnerInfo> {
        let Ok(entries) = std::fs::read_dir(&self.runner_dir) else {
            return Vec::new();
        };

        let mut running = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("task_") || !name.ends_with("_info.json") {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(info) = serde_json::from_str::<RunnerInfo>(&raw) else {
                tracing::warn!(file = %name, "unreadable runner info file");
                continue;
            };
            if probe::pid_alive(info.pid as i32) {
                running.push(info);
            } else {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        running
    }

    /// Kill a runner by task id. Returns whether a runner was found.
    pub async fn kill(&self, task_id: i64, force: bool) -> bool {
        let info_path = self.info_path(task_id);
        let Ok(raw) = std::fs::read_to_string(&info_path) else {
            return false;
        };
        let Ok(info) = serde_json::from_str::<RunnerInfo>(&raw) else {
            let _ = std::fs::remove_file(&info_path);
            return false;
        };

        let pid = info.pid as i32;
        let killed = if force {
            #[cfg(unix)]
            {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
            true
        } else {
            probe::terminate_with_grace(pid, std::time::Duration::from_secs(5)).await
        };

        let _ = std::fs::remove_file(&info_path);
        let _ = std::fs::remove_file(&info.script_path);
        killed
    }

    /// Remove runner artifacts older than `days`.
    pub fn cleanup_old_files(&self, days: u64) {
        let Ok(entries) = std::fs::read_dir(&self.runner_dir) else {
            return;
        };
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(days.saturating_mul(24 * 3600));
        let mut cleaned = 0;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("task_") {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if old && std::fs::remove_file(entry.path()).is_ok() {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::info!(cleaned, dir = %self.runner_dir.display(), "cleaned up old runner files");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> (IsolatedRunner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            IsolatedRunner::new(dir.path().join("runners"), dir.path().join("logs")),
            dir,
        )
    }

    #[test]
    fn test_running_tasks_prunes_dead_entries() {
        let (runner, _dir) = runner();
        std::fs::create_dir_all(&runner.runner_dir).unwrap();

        let dead = RunnerInfo {
            task_id: 9,
            pid: 99_999_994,
            script_path: runner.runner_dir.join("task_9_runner.sh"),
            log_file: runner.log_dir.join("task_9_subprocess.log"),
        };
        let info_path = runner.info_path(9);
        std::fs::write(&info_path, serde_json::to_string(&dead).unwrap()).unwrap();

        assert!(runner.running_tasks().is_empty());
        assert!(!info_path.exists());
    }

    #[test]
    fn test_running_tasks_keeps_live_entries() {
        let (runner, _dir) = runner();
        std::fs::create_dir_all(&runner.runner_dir).unwrap();

        let live = RunnerInfo {
            task_id: 3,
            pid: std::process::id(),
            script_path: runner.runner_dir.join("task_3_runner.sh"),
            log_file: runner.log_dir.join("task_3_subprocess.log"),
        };
        std::fs::write(runner.info_path(3), serde_json::to_string(&live).unwrap()).unwrap();

        let running = runner.running_tasks();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, 3);
    }

    #[test]
    fn test_kill_unknown_task_returns_false() {
        let (runner, _dir) = runner();
        let result = futures::executor::block_on(runner.kill(42, false));
        assert!(!result);
    }
}
