//! Circuit breaker with state persisted across restarts.
//!
//! Keyed failure gates: CLOSED lets calls through, OPEN refuses them, and
//! HALF_OPEN probes recovery after a cooldown. Every state change is
//! written to a single JSON file with an atomic rename so breaker history
//! survives a crash.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Configuration for circuit breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before permitting a probe.
    pub cooldown_secs: f64,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Whether breakers are enforced at all.
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60.0,
            success_threshold: 2,
            enabled: true,
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are refused.
    Open,
    /// Testing whether the failing dependency has recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Persistent state for one keyed breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl BreakerState {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_updated: Utc::now(),
        }
    }
}

/// JSON-file persistence for breaker states.
///
/// The load path tolerates a missing or partially corrupt file: entries
/// that fail to decode are skipped, never fatal.
pub struct BreakerStore {
    path: PathBuf,
}

impl BreakerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> HashMap<String, BreakerState> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            tracing::warn!(path = %self.path.display(), "circuit breaker file is corrupt, starting fresh");
            return HashMap::new();
        };
        let Some(map) = value.as_object() else {
            return HashMap::new();
        };

        let mut states = HashMap::new();
        for (key, entry) in map {
            match serde_json::from_value::<BreakerState>(entry.clone()) {
                Ok(state) => {
                    states.insert(key.clone(), state);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping corrupt circuit breaker entry");
                }
            }
        }
        states
    }

    /// Atomic write: temp file then rename, so readers never observe a
    /// torn file.
    pub fn save(&self, states: &HashMap<String, BreakerState>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(states)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keyed circuit breaker service.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    store: BreakerStore,
    states: Arc<Mutex<HashMap<String, BreakerState>>>,
}

impl CircuitBreakers {
    /// Create the service, loading any persisted state from disk.
    pub fn new(config: CircuitBreakerConfig, storage_path: PathBuf) -> Self {
        let store = BreakerStore::new(storage_path);
        let states = store.load();
        if !states.is_empty() {
            tracing::info!(count = states.len(), "loaded circuit breaker states from disk");
        }
        Self {
            config,
            store,
            states: Arc::new(Mutex::new(states)),
        }
    }

    /// Whether an attempt should proceed for this key.
    ///
    /// An OPEN circuit whose cooldown has elapsed transitions to
    /// HALF_OPEN and permits one probe.
    pub async fn should_attempt(&self, key: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut states = self.states.lock().await;
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::new(key));

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooldown = ChronoDuration::milliseconds(
                    (self.config.cooldown_secs * 1000.0) as i64,
                );
                let elapsed_enough = state
                    .last_failure_time
                    .map(|t| Utc::now() - t >= cooldown)
                    .unwrap_or(true);
                if elapsed_enough {
                    tracing::info!(key = %key, "circuit breaker entering half-open state");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.last_updated = Utc::now();
                    self.persist(&states);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful attempt.
    pub async fn record_success(&self, key: &str) {
        if !self.config.enabled {
            return;
        }

        let mut states = self.states.lock().await;
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::new(key));

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(key = %key, "circuit breaker closing after recovery");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                }
            }
            CircuitState::Closed => {
                // Successes decay the failure count.
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
        state.last_updated = Utc::now();
        self.persist(&states);
    }

    /// Record a failed attempt.
    pub async fn record_failure(&self, key: &str) {
        if !self.config.enabled {
            return;
        }

        let mut states = self.states.lock().await;
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::new(key));

        state.failure_count += 1;
        state.last_failure_time = Some(Utc::now());
        state.success_count = 0;

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        key = %key,
                        failures = state.failure_count,
                        "circuit breaker opening"
                    );
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(key = %key, "circuit breaker reopening after half-open failure");
                state.state = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
        state.last_updated = Utc::now();
        self.persist(&states);
    }

    pub async fn state_of(&self, key: &str) -> Option<CircuitState> {
        let states = self.states.lock().await;
        states.get(key).map(|s| s.state)
    }

    pub async fn failure_count(&self, key: &str) -> u32 {
        let states = self.states.lock().await;
        states.get(key).map(|s| s.failure_count).unwrap_or(0)
    }

    /// Remove states not updated within `max_age_days`.
    ///
    /// Must run periodically; without it the persistence file grows
    /// without bound.
    pub async fn cleanup_old_states(&self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, state| state.last_updated >= cutoff);
        let removed = before - states.len();
        if removed > 0 {
            tracing::info!(removed, "cleaned up old circuit breaker states");
            self.persist(&states);
        }
        removed
    }

    fn persist(&self, states: &HashMap<String, BreakerState>) {
        if let Err(e) = self.store.save(states) {
            tracing::error!(error = %e, "failed to persist circuit breaker states");
        }
    }
}
