//! Pool metrics and worker snapshots.

use crate::core::worker::{WorkerInstance, WorkerStatus};
use crate::protocol::WorkerId;
use crate::task::{TaskId, TaskOutcome, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod prometheus;

#[cfg(feature = "metrics")]
pub use self::prometheus::PrometheusExporter;

/// Weight of the newest sample in per-type moving averages
const EMA_ALPHA: f64 = 0.2;

/// Per task-type counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskTypeStats {
    /// Successful executions
    pub completed: u64,
    /// Failed, timed out or cancelled executions
    pub failed: u64,
    /// Exponential moving average of execution time
    pub avg_duration: Option<Duration>,
    /// Slowest execution seen
    pub max_duration: Duration,
}

impl TaskTypeStats {
    fn record(&mut self, success: bool, duration: Option<Duration>) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }

        if let Some(duration) = duration {
            self.avg_duration = Some(match self.avg_duration {
                Some(avg) => avg.mul_f64(1.0 - EMA_ALPHA) + duration.mul_f64(EMA_ALPHA),
                None => duration,
            });
            self.max_duration = self.max_duration.max(duration);
        }
    }
}

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub uptime: Duration,
    pub tasks_completed: u64,
    pub error_count: u64,
    pub avg_task_time: Option<Duration>,
    pub current_memory: u64,
    pub peak_memory: u64,
    pub current_task: Option<TaskId>,
    pub last_error: Option<String>,
    /// Time since the worker went idle, when it is idle
    pub idle_for: Option<Duration>,
}

/// Overall pool condition, as logged by the health line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolHealth::Healthy => "HEALTHY",
            PoolHealth::Degraded => "DEGRADED",
            PoolHealth::Critical => "CRITICAL",
        })
    }
}

/// Aggregated pool metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    /// Live workers, whatever their state
    pub pool_size: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub starting_workers: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    /// Tasks that reached a terminal state
    pub total_processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    /// Mean execution time of tasks that ran
    pub avg_task_time: Option<Duration>,
    /// Failed and timed-out tasks over processed tasks
    pub error_rate: f64,
    /// Processed tasks per second since start
    pub throughput: f64,
    /// Busy workers over pool size
    pub efficiency: f64,
    pub peak_memory: u64,
    pub workers_spawned: u64,
    pub worker_failures: u64,
    pub uptime: Duration,
    pub task_types: HashMap<String, TaskTypeStats>,
}

impl PoolMetrics {
    /// Classify the pool against its configured minimum.
    pub fn health(&self, min_workers: usize) -> PoolHealth {
        let ready = self.busy_workers + self.idle_workers;
        if ready == 0 && (min_workers > 0 || self.queued_tasks > 0) {
            PoolHealth::Critical
        } else if self.pool_size < min_workers {
            PoolHealth::Degraded
        } else {
            PoolHealth::Healthy
        }
    }
}

/// Running totals kept by the control loop
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    started_at: Instant,
    completed: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
    total_execution_time: Duration,
    timed_runs: u32,
    workers_spawned: u64,
    worker_failures: u64,
    peak_memory: u64,
    task_types: HashMap<String, TaskTypeStats>,
}

impl MetricsRecorder {
    pub(crate) fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            completed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            total_execution_time: Duration::ZERO,
            timed_runs: 0,
            workers_spawned: 0,
            worker_failures: 0,
            peak_memory: 0,
            task_types: HashMap::new(),
        }
    }

    pub(crate) fn record_outcome(&mut self, outcome: &TaskOutcome) {
        match outcome.status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Timeout => self.timed_out += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }

        if let Some(duration) = outcome.execution_time {
            self.total_execution_time += duration;
            self.timed_runs = self.timed_runs.saturating_add(1);
        }
        if let Some(memory) = outcome.memory_usage {
            self.record_memory(memory);
        }

        self.task_types
            .entry(outcome.task_type.clone())
            .or_default()
            .record(outcome.success, outcome.execution_time);
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed
    }

    pub(crate) fn record_memory(&mut self, bytes: u64) {
        self.peak_memory = self.peak_memory.max(bytes);
    }

    pub(crate) fn record_spawn(&mut self) {
        self.workers_spawned += 1;
    }

    pub(crate) fn record_worker_failure(&mut self) {
        self.worker_failures += 1;
    }

    pub(crate) fn snapshot<'a>(
        &self,
        workers: impl Iterator<Item = &'a WorkerInstance>,
        queued_tasks: usize,
        running_tasks: usize,
        now: Instant,
    ) -> PoolMetrics {
        let mut metrics = PoolMetrics {
            queued_tasks,
            running_tasks,
            completed: self.completed,
            failed: self.failed,
            timed_out: self.timed_out,
            cancelled: self.cancelled,
            total_processed: self.completed + self.failed + self.timed_out + self.cancelled,
            peak_memory: self.peak_memory,
            workers_spawned: self.workers_spawned,
            worker_failures: self.worker_failures,
            uptime: now.saturating_duration_since(self.started_at),
            task_types: self.task_types.clone(),
            ..PoolMetrics::default()
        };

        for worker in workers {
            metrics.pool_size += 1;
            metrics.peak_memory = metrics.peak_memory.max(worker.peak_memory);
            match worker.status {
                WorkerStatus::Busy => metrics.busy_workers += 1,
                WorkerStatus::Idle => metrics.idle_workers += 1,
                WorkerStatus::Starting => metrics.starting_workers += 1,
                WorkerStatus::Error | WorkerStatus::Terminated => {}
            }
        }

        if self.timed_runs > 0 {
            metrics.avg_task_time = Some(self.total_execution_time / self.timed_runs);
        }
        if metrics.total_processed > 0 {
            metrics.error_rate =
                (self.failed + self.timed_out) as f64 / metrics.total_processed as f64;
        }
        let uptime = metrics.uptime.as_secs_f64();
        if uptime > 0.0 {
            metrics.throughput = metrics.total_processed as f64 / uptime;
        }
        if metrics.pool_size > 0 {
            metrics.efficiency = metrics.busy_workers as f64 / metrics.pool_size as f64;
        }

        metrics
    }
}
