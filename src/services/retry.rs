//! Retry policy: error classification, backoff computation, and the
//! breaker-guarded execution wrapper.
//!
//! The retry loop itself is a plain loop over classified results; no
//! control flow rides on panics or exceptions.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::adapters::runtime::AgentError;
use crate::domain::models::RetrySettings;

use super::circuit_breaker::CircuitBreakers;

/// Backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fibonacci,
    Fixed,
}

impl RetryStrategy {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            "fibonacci" => Some(Self::Fibonacci),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }
}

/// Which retry profile an error falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Ordinary transient errors: 1s seed, doubling.
    Default,
    /// Rate limits: 60s seed, gentler growth, more attempts.
    RateLimit,
}

/// Retry policy derived from configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub strategy: RetryStrategy,
    pub rate_limit_initial_delay: Duration,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default(), 3)
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs_f64(settings.initial_delay_secs),
            max_delay: Duration::from_secs_f64(settings.max_delay_secs),
            exponential_base: settings.exponential_base,
            jitter: settings.jitter,
            strategy: RetryStrategy::from_str(&settings.strategy)
                .unwrap_or(RetryStrategy::Exponential),
            rate_limit_initial_delay: Duration::from_secs_f64(
                settings.rate_limit_initial_delay_secs,
            ),
            rate_limit_max_attempts: settings.rate_limit_max_attempts,
            rate_limit_base: settings.rate_limit_exponential_base,
        }
    }

    /// Classify an error into its retry profile.
    pub fn classify(&self, error: &AgentError) -> ErrorClass {
        if error.is_rate_limited() {
            ErrorClass::RateLimit
        } else {
            ErrorClass::Default
        }
    }

    /// Attempt ceiling for a class.
    pub fn max_attempts_for(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Default => self.max_attempts,
            ErrorClass::RateLimit => self.rate_limit_max_attempts,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (1-based). Capped, with ±25% jitter unless disabled, never below
    /// 100ms.
    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        let (initial, base) = match class {
            ErrorClass::Default => (self.initial_delay.as_secs_f64(), self.exponential_base),
            ErrorClass::RateLimit => (
                self.rate_limit_initial_delay.as_secs_f64(),
                self.rate_limit_base,
            ),
        };
        let n = attempt.max(1);

        let raw = match self.strategy {
            RetryStrategy::Exponential => initial * base.powi(n as i32 - 1),
            RetryStrategy::Linear => initial * f64::from(n),
            RetryStrategy::Fibonacci => initial * f64::from(fibonacci(n)),
            RetryStrategy::Fixed => initial,
        };

        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            let spread = capped * 0.25;
            capped + rand::rng().random_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.1))
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Error from a breaker-guarded retried operation.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Circuit breaker open for {key}")]
    CircuitOpen { key: String },

    #[error("{0}")]
    Permanent(AgentError),

    #[error("{error} | Failed after {attempts} attempts")]
    Exhausted { error: AgentError, attempts: u32 },
}

/// A successfully retried operation: the value and how many attempts ran.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Execute an operation with retry and circuit-breaker protection.
///
/// The breaker is consulted before every attempt; refusal under OPEN is an
/// immediate permanent error. Success and failure are both recorded on
/// the breaker. Transient errors back off per the policy; permanent ones
/// return at once.
///
/// `op` receives the 1-based attempt number. `on_retry` runs after a
/// failed attempt that will be retried, before the backoff sleep; callers
/// use it to surface the retry in their own logs.
pub async fn execute_with_retry<T, F, Fut, R, RFut>(
    policy: &RetryPolicy,
    breakers: &CircuitBreakers,
    key: &str,
    mut op: F,
    mut on_retry: R,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
    R: FnMut(u32, AgentError, Duration) -> RFut,
    RFut: Future<Output = ()>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        if !breakers.should_attempt(key).await {
            return Err(RetryError::CircuitOpen {
                key: key.to_string(),
            });
        }

        match op(attempt).await {
            Ok(value) => {
                breakers.record_success(key).await;
                if attempt > 1 {
                    tracing::info!(key = %key, attempts = attempt, "retry succeeded");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) => {
                breakers.record_failure(key).await;

                if !error.is_transient() {
                    return Err(RetryError::Permanent(error));
                }

                let class = policy.classify(&error);
                if attempt >= policy.max_attempts_for(class) {
                    return Err(RetryError::Exhausted {
                        error,
                        attempts: attempt,
                    });
                }

                let delay = policy.delay_for(attempt, class);
                tracing::warn!(
                    key = %key,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %error,
                    "attempt failed, retrying"
                );
                on_retry(attempt, error, delay).await;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
