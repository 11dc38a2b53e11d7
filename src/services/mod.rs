//! Services: the engine logic above the adapters.

pub mod circuit_breaker;
pub mod log_formatter;
pub mod memory_monitor;
pub mod notification;
pub mod orchestrator;
pub mod retry;
pub mod task_runner;

pub use circuit_breaker::{BreakerState, BreakerStore, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use memory_monitor::{MemoryMonitor, SystemSample, TaskMetrics};
pub use notification::{SoundEvent, SoundNotifier};
pub use orchestrator::{validate_graph, Orchestrator, SKIP_REASON};
pub use retry::{execute_with_retry, ErrorClass, Retried, RetryError, RetryPolicy, RetryStrategy};
pub use task_runner::{check_admission, TaskRunner};
