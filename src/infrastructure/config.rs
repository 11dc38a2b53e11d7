//! Configuration loading with hierarchical merging.
//!
//! Precedence, lowest to highest: programmatic defaults, the user config
//! file (`~/.claude-cto/config.yaml`), then environment variables. Env
//! names are the stable operational surface and are applied explicitly.

use anyhow::{Context, Result};
use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid max_concurrent_tasks: {0}. Must be between 1 and 100")]
    InvalidMaxConcurrentTasks(usize),

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid memory thresholds: warning {warning} must be below critical {critical}")]
    InvalidMemoryThresholds { warning: f64, critical: f64 },

    #[error("Invalid retry delays: initial {initial}s must not exceed max {max}s")]
    InvalidRetryDelays { initial: f64, max: f64 },

    #[error("Invalid {name}: {value}")]
    InvalidEnvVar { name: &'static str, value: String },
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from defaults, the app-dir config file, and
    /// environment variables.
    pub fn load() -> Result<Config> {
        let config_file = crate::infrastructure::paths::app_dir().join("config.yaml");
        Self::load_from(&config_file)
    }

    pub fn load_from(config_file: &Path) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(config_file))
            .extract()
            .context("Failed to extract configuration")?;

        Self::apply_env_overrides(&mut config)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Apply the recognized environment overrides.
    fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(
            name: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match std::env::var(name) {
                Ok(value) if !value.is_empty() => {
                    value.parse().map(Some).map_err(|_| ConfigError::InvalidEnvVar {
                        name,
                        value,
                    })
                }
                _ => Ok(None),
            }
        }

        if let Some(v) = parse::<usize>("MAX_CONCURRENT_TASKS")? {
            config.task.max_concurrent_tasks = v;
        }
        if let Some(v) = parse::<u64>("TASK_TIMEOUT")? {
            config.task.task_timeout_seconds = v;
        }
        if let Some(v) = parse::<u64>("TASK_MEMORY_LIMIT_MB")? {
            config.task.task_memory_limit_mb = v;
        }
        if let Some(v) = parse::<u16>("SERVER_PORT")? {
            config.server.port = v;
        }
        if let Some(v) = parse::<f64>("MEMORY_WARNING_THRESHOLD")? {
            config.resources.memory_warning_threshold = v;
        }
        if let Some(v) = parse::<f64>("MEMORY_CRITICAL_THRESHOLD")? {
            config.resources.memory_critical_threshold = v;
        }
        if let Ok(v) = std::env::var("CLAUDE_CTO_ISOLATED_TASKS") {
            config.task.use_isolated_tasks = matches!(v.to_lowercase().as_str(), "true" | "1");
        }
        if let Ok(v) = std::env::var("CLAUDE_CTO_DB") {
            if !v.is_empty() {
                config.database.path = Some(v.into());
            }
        }
        Ok(())
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.task.max_concurrent_tasks == 0 || config.task.max_concurrent_tasks > 100 {
            return Err(ConfigError::InvalidMaxConcurrentTasks(
                config.task.max_concurrent_tasks,
            ));
        }
        if config.task.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.task.max_retries));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.server.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.server.log_level.clone()));
        }

        if config.resources.memory_warning_threshold >= config.resources.memory_critical_threshold {
            return Err(ConfigError::InvalidMemoryThresholds {
                warning: config.resources.memory_warning_threshold,
                critical: config.resources.memory_critical_threshold,
            });
        }

        if config.retry.initial_delay_secs > config.retry.max_delay_secs {
            return Err(ConfigError::InvalidRetryDelays {
                initial: config.retry.initial_delay_secs,
                max: config.retry.max_delay_secs,
            });
        }
        Ok(())
    }
}
