//! OS process probes: liveness, identity, and graceful termination.
//!
//! Identity checks use the entrypoint environment marker written onto
//! every process this system spawns, read back from /proc on unix.

use std::time::Duration;

use crate::adapters::runtime::{ENTRYPOINT_ENV, ENTRYPOINT_VALUE};

/// Whether a pid refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i32) -> bool {
    false
}

/// Read a process's command line from /proc.
#[cfg(unix)]
pub fn process_cmdline(pid: i32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .map(|part| String::from_utf8_lossy(part).to_string())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

#[cfg(not(unix))]
pub fn process_cmdline(_pid: i32) -> Option<String> {
    None
}

/// Whether a live process carries our entrypoint marker in its
/// environment, or runs the claude-cto binary.
#[cfg(unix)]
pub fn is_our_process(pid: i32) -> bool {
    if pid == std::process::id() as i32 {
        return true;
    }
    if let Ok(raw) = std::fs::read(format!("/proc/{pid}/environ")) {
        let needle = format!("{ENTRYPOINT_ENV}={ENTRYPOINT_VALUE}");
        let has_marker = raw
            .split(|b| *b == 0)
            .any(|entry| String::from_utf8_lossy(entry) == needle);
        if has_marker {
            return true;
        }
    }
    process_cmdline(pid)
        .map(|cmdline| cmdline.contains("claude-cto"))
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_our_process(_pid: i32) -> bool {
    false
}

/// Parent pid of a process, from /proc status.
#[cfg(unix)]
pub fn parent_pid(pid: i32) -> Option<i32> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find(|line| line.starts_with("PPid:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|raw| raw.parse().ok())
}

#[cfg(not(unix))]
pub fn parent_pid(_pid: i32) -> Option<i32> {
    None
}

/// Scan the process table for live processes carrying the entrypoint
/// marker. Used by recovery to find strays after a crash.
#[cfg(unix)]
pub fn scan_marked_processes() -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let needle = format!("{ENTRYPOINT_ENV}={ENTRYPOINT_VALUE}");
    let own_pid = std::process::id() as i32;

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_string_lossy().parse::<i32>().ok())
        .filter(|pid| *pid != own_pid)
        .filter(|pid| {
            std::fs::read(format!("/proc/{pid}/environ"))
                .map(|raw| {
                    raw.split(|b| *b == 0)
                        .any(|e| String::from_utf8_lossy(e) == needle)
                })
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(not(unix))]
pub fn scan_marked_processes() -> Vec<i32> {
    Vec::new()
}

/// SIGTERM a process, wait up to `grace` for it to exit, then SIGKILL.
/// Returns true when the process is gone afterwards.
#[cfg(unix)]
pub async fn terminate_with_grace(pid: i32, grace: Duration) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid);
    if kill(target, Signal::SIGTERM).is_err() {
        return !pid_alive(pid);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = kill(target, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_millis(100)).await;
    !pid_alive(pid)
}

#[cfg(not(unix))]
pub async fn terminate_with_grace(_pid: i32, _grace: Duration) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn test_bogus_pid_is_dead() {
        assert!(!pid_alive(-1));
        // Pid far beyond pid_max on any reasonable system.
        assert!(!pid_alive(99_999_999));
    }

    #[cfg(unix)]
    #[test]
    fn test_own_cmdline_readable() {
        let cmdline = process_cmdline(std::process::id() as i32);
        assert!(cmdline.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_with_grace_kills_child() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        assert!(pid_alive(pid));
        assert!(terminate_with_grace(pid, Duration::from_secs(2)).await);
    }
}
