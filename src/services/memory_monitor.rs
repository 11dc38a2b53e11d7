//! Memory and resource monitoring.
//!
//! A background sampler accumulates per-task and system-wide memory
//! metrics on a fixed interval. Retention is bounded: the system history
//! is a ring and finished task metrics are pruned after an hour.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};

use crate::domain::models::ResourceConfig;

/// Maximum retained system samples (one hour at the default 5s interval).
const MAX_HISTORY: usize = 720;
/// How long finished task metrics stay queryable.
const FINISHED_RETENTION_MINUTES: i64 = 60;

/// Metrics for a single task execution.
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub peak_memory_mb: f64,
    pub avg_memory_mb: f64,
    pub samples: u64,
    pub success: Option<bool>,
}

impl TaskMetrics {
    fn new(task_id: i64) -> Self {
        Self {
            task_id,
            start_time: Utc::now(),
            end_time: None,
            peak_memory_mb: 0.0,
            avg_memory_mb: 0.0,
            samples: 0,
            success: None,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }

    fn record_sample(&mut self, memory_mb: f64) {
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);
        let total = self.avg_memory_mb * self.samples as f64 + memory_mb;
        self.samples += 1;
        self.avg_memory_mb = total / self.samples as f64;
    }
}

/// One system-wide sample.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub memory_available_mb: f64,
    pub active_tasks: usize,
}

#[derive(Default)]
struct MonitorState {
    active: HashMap<i64, TaskMetrics>,
    finished: Vec<TaskMetrics>,
    history: VecDeque<SystemSample>,
}

/// Background memory monitor.
///
/// Constructed once per process and shared by handle; the sampler loop is
/// spawned from the server entry point.
pub struct MemoryMonitor {
    config: ResourceConfig,
    state: Arc<RwLock<MonitorState>>,
}

impl MemoryMonitor {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
        }
    }

    /// Begin tracking a task.
    pub async fn start_task(&self, task_id: i64) {
        let mut state = self.state.write().await;
        state.active.insert(task_id, TaskMetrics::new(task_id));
    }

    /// Stop tracking a task and return its final metrics.
    pub async fn end_task(&self, task_id: i64, success: bool) -> Option<TaskMetrics> {
        let mut state = self.state.write().await;
        let mut metrics = state.active.remove(&task_id)?;
        metrics.end_time = Some(Utc::now());
        metrics.success = Some(success);
        state.finished.push(metrics.clone());
        Some(metrics)
    }

    pub async fn active_task_count(&self) -> usize {
        self.state.read().await.active.len()
    }

    pub async fn latest_sample(&self) -> Option<SystemSample> {
        self.state.read().await.history.back().cloned()
    }

    /// Spawn the sampler loop. Returns the join handle; aborting it stops
    /// sampling.
    pub fn spawn_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = Duration::from_secs(monitor.config.sample_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                monitor.sample(&mut system).await;
            }
        })
    }

    async fn sample(&self, system: &mut System) {
        system.refresh_memory();
        let own_pid = Pid::from_u32(std::process::id());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[own_pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        let total_mb = system.total_memory() as f64 / 1024.0 / 1024.0;
        let used_mb = system.used_memory() as f64 / 1024.0 / 1024.0;
        let available_mb = system.available_memory() as f64 / 1024.0 / 1024.0;
        let percent = if total_mb > 0.0 {
            used_mb / total_mb * 100.0
        } else {
            0.0
        };

        // In-process tasks share the server's address space, so per-task
        // samples use the server process footprint.
        let own_mb = system
            .process(own_pid)
            .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0);

        if percent >= self.config.memory_critical_threshold {
            tracing::error!(
                memory_percent = percent,
                "system memory critically high"
            );
        } else if percent >= self.config.memory_warning_threshold {
            tracing::warn!(memory_percent = percent, "system memory high");
        }

        let mut state = self.state.write().await;
        for metrics in state.active.values_mut() {
            metrics.record_sample(own_mb);
        }

        let active_tasks = state.active.len();
        state.history.push_back(SystemSample {
            timestamp: Utc::now(),
            memory_percent: percent,
            memory_used_mb: used_mb,
            memory_available_mb: available_mb,
            active_tasks,
        });
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }

        let cutoff = Utc::now() - ChronoDuration::minutes(FINISHED_RETENTION_MINUTES);
        state
            .finished
            .retain(|m| m.end_time.map(|t| t >= cutoff).unwrap_or(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_lifecycle_tracking() {
        let monitor = MemoryMonitor::new(ResourceConfig::default());
        monitor.start_task(1).await;
        assert_eq!(monitor.active_task_count().await, 1);

        let metrics = monitor.end_task(1, true).await.unwrap();
        assert_eq!(metrics.task_id, 1);
        assert_eq!(metrics.success, Some(true));
        assert!(metrics.duration_seconds().unwrap() >= 0.0);
        assert_eq!(monitor.active_task_count().await, 0);

        assert!(monitor.end_task(1, true).await.is_none());
    }

    #[tokio::test]
    async fn test_sampling_updates_active_tasks_and_history() {
        let monitor = Arc::new(MemoryMonitor::new(ResourceConfig::default()));
        monitor.start_task(7).await;

        let mut system = System::new();
        monitor.sample(&mut system).await;
        monitor.sample(&mut system).await;

        let sample = monitor.latest_sample().await.unwrap();
        assert_eq!(sample.active_tasks, 1);

        let metrics = monitor.end_task(7, false).await.unwrap();
        assert_eq!(metrics.samples, 2);
        assert!(metrics.peak_memory_mb >= metrics.avg_memory_mb);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let monitor = Arc::new(MemoryMonitor::new(ResourceConfig::default()));
        let mut system = System::new();
        for _ in 0..(MAX_HISTORY + 5) {
            monitor.sample(&mut system).await;
        }
        let state = monitor.state.read().await;
        assert_eq!(state.history.len(), MAX_HISTORY);
    }
}
