//! Per-port server instance lock.
//!
//! One PID file per bound port in a well-known directory guarantees at
//! most one server per port. Stale locks (dead pid, or a live pid that is
//! not one of our servers) are detected and removed; `kill_existing`
//! reclaims the port from a live duplicate.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::probe;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Server already running on port {port} (PID {pid})")]
    AlreadyRunning { port: u16, pid: i32 },

    #[error("Failed to kill existing server (PID {pid})")]
    KillFailed { pid: i32 },

    #[error("Lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock manager for one port.
pub struct ServerLock {
    port: u16,
    lock_dir: PathBuf,
    lock_file: PathBuf,
    pid: i32,
}

impl ServerLock {
    pub fn new(port: u16, lock_dir: PathBuf) -> Self {
        let lock_file = lock_dir.join(format!("server-{port}.pid"));
        Self {
            port,
            lock_dir,
            lock_file,
            pid: std::process::id() as i32,
        }
    }

    /// Check whether a live server of ours holds this port.
    /// Returns `(is_running, recorded_pid)`.
    pub fn is_server_running(&self) -> (bool, Option<i32>) {
        let Ok(raw) = std::fs::read_to_string(&self.lock_file) else {
            return (false, None);
        };
        let Ok(old_pid) = raw.trim().parse::<i32>() else {
            return (false, None);
        };

        if !probe::pid_alive(old_pid) {
            tracing::info!(port = self.port, pid = old_pid, "found stale lock file");
            return (false, Some(old_pid));
        }
        if !probe::is_our_process(old_pid) {
            tracing::warn!(
                port = self.port,
                pid = old_pid,
                "pid in lock file exists but is not a claude-cto server"
            );
            return (false, Some(old_pid));
        }
        (true, Some(old_pid))
    }

    /// Acquire the lock.
    ///
    /// `force` removes stale lock files; `kill_existing` terminates a
    /// live duplicate server before taking over.
    pub async fn acquire(&self, force: bool, kill_existing: bool) -> Result<(), LockError> {
        let (is_running, existing_pid) = self.is_server_running();

        if is_running {
            let pid = existing_pid.unwrap_or_default();
            if kill_existing {
                tracing::warn!(port = self.port, pid, "killing existing server");
                if !probe::terminate_with_grace(pid, Duration::from_secs(5)).await {
                    return Err(LockError::KillFailed { pid });
                }
            } else {
                return Err(LockError::AlreadyRunning {
                    port: self.port,
                    pid,
                });
            }
        }

        if self.lock_file.exists() && (force || !is_running || kill_existing) {
            std::fs::remove_file(&self.lock_file)?;
        }

        std::fs::create_dir_all(&self.lock_dir)?;
        // Atomic claim: write a temp file, rename over the lock path.
        let tmp = self.lock_file.with_extension("tmp");
        std::fs::write(&tmp, self.pid.to_string())?;
        std::fs::rename(&tmp, &self.lock_file)?;

        tracing::info!(port = self.port, pid = self.pid, "acquired server lock");
        Ok(())
    }

    /// Release the lock, but only if the file still holds our pid.
    pub fn release(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.lock_file) else {
            return;
        };
        match raw.trim().parse::<i32>() {
            Ok(stored) if stored == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.lock_file) {
                    tracing::error!(error = %e, "failed to remove lock file");
                } else {
                    tracing::info!(port = self.port, "released server lock");
                }
            }
            Ok(stored) => {
                tracing::warn!(
                    stored,
                    own = self.pid,
                    "lock file contains a different pid, not removing"
                );
            }
            Err(e) => tracing::error!(error = %e, "unreadable lock file on release"),
        }
    }

    /// Remove every stale lock file in the directory. Returns the count.
    pub fn cleanup_all_locks(lock_dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(lock_dir) else {
            return 0;
        };
        let mut cleaned = 0;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("server-") || !name.ends_with(".pid") {
                continue;
            }
            let stale = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| raw.trim().parse::<i32>().ok())
                .map(|pid| !probe::pid_alive(pid))
                .unwrap_or(true);
            if stale && std::fs::remove_file(&path).is_ok() {
                tracing::info!(lock = %name, "cleaned up stale lock");
                cleaned += 1;
            }
        }
        cleaned
    }

    /// All live servers holding locks: `(port, pid)` pairs.
    pub fn all_running_servers(lock_dir: &Path) -> Vec<(u16, i32)> {
        let Ok(entries) = std::fs::read_dir(lock_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let port: u16 = name
                    .strip_prefix("server-")?
                    .strip_suffix(".pid")?
                    .parse()
                    .ok()?;
                let pid: i32 = std::fs::read_to_string(entry.path())
                    .ok()?
                    .trim()
                    .parse()
                    .ok()?;
                (probe::pid_alive(pid) && probe::is_our_process(pid)).then_some((port, pid))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ServerLock::new(8111, dir.path().to_path_buf());

        lock.acquire(false, false).await.unwrap();
        let (_, pid) = lock.is_server_running();
        assert_eq!(pid, Some(std::process::id() as i32));

        lock.release();
        assert!(!dir.path().join("server-8111.pid").exists());
    }

    #[tokio::test]
    async fn test_release_spares_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("server-8112.pid");
        std::fs::write(&lock_path, "12345").unwrap();

        let lock = ServerLock::new(8112, dir.path().to_path_buf());
        lock.release();
        // Foreign pid in the file: must not be removed.
        assert!(lock_path.exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("server-8113.pid");
        std::fs::write(&lock_path, "99999999").unwrap();

        let lock = ServerLock::new(8113, dir.path().to_path_buf());
        let (running, pid) = lock.is_server_running();
        assert!(!running);
        assert_eq!(pid, Some(99_999_999));

        lock.acquire(true, false).await.unwrap();
        let raw = std::fs::read_to_string(&lock_path).unwrap();
        assert_eq!(raw.trim(), std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_cleanup_all_locks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server-9001.pid"), "99999991").unwrap();
        std::fs::write(dir.path().join("server-9002.pid"), "not a pid").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        let cleaned = ServerLock::cleanup_all_locks(&dir.path().to_path_buf());
        assert_eq!(cleaned, 2);
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
