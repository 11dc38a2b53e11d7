//! Server configuration records.
//!
//! Explicit, typed configuration. Every recognized option is a named field;
//! unknown fields in the config file are rejected at load time.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Task execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TaskConfig {
    /// Running-task ceiling enforced at admission.
    pub max_concurrent_tasks: usize,
    /// Hard wall-clock cap for the isolated runner, in seconds.
    pub task_timeout_seconds: u64,
    /// Memory ceiling applied to task subprocesses, in megabytes.
    pub task_memory_limit_mb: u64,
    /// Run tasks in detached runner subprocesses instead of on the server loop.
    pub use_isolated_tasks: bool,
    /// Age after which runner artifacts and registry entries are collected.
    pub cleanup_interval_days: u64,
    /// Maximum attempts per task before finalizing FAILED.
    pub max_retries: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout_seconds: 7200,
            task_memory_limit_mb: 4096,
            use_isolated_tasks: false,
            cleanup_interval_days: 7,
            max_retries: 3,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Run startup recovery before accepting requests.
    pub cleanup_on_startup: bool,
    /// Reclaim the port lock from a live duplicate server.
    pub kill_duplicate_servers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            cleanup_on_startup: true,
            kill_duplicate_servers: false,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    /// Override path for the tasks database. Defaults to `<app_dir>/tasks.db`.
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

/// Resource monitoring thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceConfig {
    /// System memory percentage that triggers a warning.
    pub memory_warning_threshold: f64,
    /// System memory percentage that triggers a critical alert.
    pub memory_critical_threshold: f64,
    /// Sampling interval for the memory monitor, in seconds.
    pub sample_interval_seconds: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_warning_threshold: 80.0,
            memory_critical_threshold: 95.0,
            sample_interval_seconds: 5,
        }
    }
}

/// Retry and circuit-breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySettings {
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Backoff strategy: exponential, linear, fibonacci, or fixed.
    pub strategy: String,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: f64,
    pub circuit_breaker_enabled: bool,
    pub rate_limit_initial_delay_secs: f64,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_exponential_base: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: 1.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
            jitter: true,
            strategy: "exponential".to_string(),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60.0,
            circuit_breaker_enabled: true,
            rate_limit_initial_delay_secs: 60.0,
            rate_limit_max_attempts: 5,
            rate_limit_exponential_base: 1.5,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub task: TaskConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub resources: ResourceConfig,
    pub retry: RetrySettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.task.max_concurrent_tasks, 10);
        assert_eq!(config.task.max_retries, 3);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.retry.circuit_breaker_threshold, 5);
        assert!(!config.task.use_isolated_tasks);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "task:\n  max_concurrent_tasks: 4\n  bogus_option: true\n";
        let parsed: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }
}
