//! Sound notifications for task lifecycle events.
//!
//! Fire-and-forget side effect on terminal transitions. Playback is
//! spawned with a short timeout and every error is swallowed: a broken
//! sound setup must never affect task execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::adapters::runtime::claude_code::find_in_path;
use crate::infrastructure::paths::app_dir;

const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Which lifecycle moment to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundEvent {
    Start,
    Success,
    Failure,
}

/// Cross-platform sound notifier.
pub struct SoundNotifier {
    enabled: bool,
    player: Option<String>,
    start_sound: Option<PathBuf>,
    success_sound: Option<PathBuf>,
    failure_sound: Option<PathBuf>,
}

impl SoundNotifier {
    pub fn new() -> Self {
        let enabled = std::env::var("CLAUDE_CTO_ENABLE_SOUNDS")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(true);
        let player = detect_player();

        let notifier = Self {
            enabled: enabled && player.is_some(),
            player,
            start_sound: resolve_sound("CLAUDE_CTO_START_SOUND", "start"),
            success_sound: resolve_sound("CLAUDE_CTO_SUCCESS_SOUND", "success"),
            failure_sound: resolve_sound("CLAUDE_CTO_FAILURE_SOUND", "failure"),
        };
        if notifier.enabled {
            tracing::info!(player = ?notifier.player, "sound notifications enabled");
        }
        notifier
    }

    /// Disabled notifier, for tests and headless deployments.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            player: None,
            start_sound: None,
            success_sound: None,
            failure_sound: None,
        }
    }

    /// Play the sound for an event. Non-blocking; never fails.
    pub fn notify(&self, event: SoundEvent) {
        if !self.enabled {
            return;
        }
        let Some(player) = self.player.clone() else {
            return;
        };
        let sound = match event {
            SoundEvent::Start => self.start_sound.clone(),
            SoundEvent::Success => self.success_sound.clone(),
            SoundEvent::Failure => self.failure_sound.clone(),
        };
        let Some(sound) = sound else {
            return;
        };

        tokio::spawn(async move {
            let result = tokio::time::timeout(
                PLAYBACK_TIMEOUT,
                Command::new(&player)
                    .arg(&sound)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status(),
            )
            .await;
            if let Ok(Err(e)) = result {
                tracing::debug!(error = %e, "sound playback failed");
            }
        });
    }
}

impl Default for SoundNotifier {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_player() -> Option<String> {
    ["afplay", "paplay", "aplay"]
        .iter()
        .find(|player| find_in_path(player).is_some())
        .map(|p| (*p).to_string())
}

/// Resolve a sound file: env var, then `~/.claude-cto/sounds/<name>.wav`,
/// then well-known system sounds.
fn resolve_sound(env_var: &str, name: &str) -> Option<PathBuf> {
    if let Ok(custom) = std::env::var(env_var) {
        let path = PathBuf::from(custom);
        if path.exists() {
            return Some(path);
        }
    }

    let user_sound = app_dir().join("sounds").join(format!("{name}.wav"));
    if user_sound.exists() {
        return Some(user_sound);
    }

    let system_candidates: &[&str] = match name {
        "start" => &[
            "/System/Library/Sounds/Ping.aiff",
            "/usr/share/sounds/alsa/Front_Right.wav",
        ],
        "success" => &[
            "/System/Library/Sounds/Glass.aiff",
            "/usr/share/sounds/alsa/Front_Center.wav",
        ],
        _ => &[
            "/System/Library/Sounds/Basso.aiff",
            "/usr/share/sounds/alsa/Front_Left.wav",
        ],
    };
    system_candidates
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_notifier_is_inert() {
        let notifier = SoundNotifier::disabled();
        notifier.notify(SoundEvent::Start);
        notifier.notify(SoundEvent::Success);
        notifier.notify(SoundEvent::Failure);
    }

    #[tokio::test]
    async fn test_notify_never_panics_without_sounds() {
        let notifier = SoundNotifier {
            enabled: true,
            player: Some("definitely-not-a-player".to_string()),
            start_sound: Some(PathBuf::from("/nonexistent.wav")),
            success_sound: None,
            failure_sound: None,
        };
        notifier.notify(SoundEvent::Start);
        notifier.notify(SoundEvent::Success);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
