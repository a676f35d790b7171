//! Prometheus gauges mirroring [`PoolMetrics`].

use super::PoolMetrics;
use crate::error::PoolResult;
use ::prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};

/// Keeps a prometheus registry in sync with the pool metrics.
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Registry,
    pool_size: IntGauge,
    busy_workers: IntGauge,
    idle_workers: IntGauge,
    queued_tasks: IntGauge,
    running_tasks: IntGauge,
    tasks_completed: IntGauge,
    tasks_failed: IntGauge,
    tasks_timed_out: IntGauge,
    tasks_cancelled: IntGauge,
    worker_failures: IntGauge,
    peak_memory: IntGauge,
    avg_task_seconds: Gauge,
    error_rate: Gauge,
    throughput: Gauge,
    efficiency: Gauge,
}

impl PrometheusExporter {
    /// Create the gauges under `namespace` in a fresh registry.
    pub fn new(namespace: &str) -> PoolResult<Self> {
        let registry = Registry::new();

        let int_gauge = |name: &str, help: &str| -> PoolResult<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(namespace))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let gauge = |name: &str, help: &str| -> PoolResult<Gauge> {
            let gauge = Gauge::with_opts(Opts::new(name, help).namespace(namespace))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            pool_size: int_gauge("pool_size", "Live workers")?,
            busy_workers: int_gauge("workers_busy", "Workers running a task")?,
            idle_workers: int_gauge("workers_idle", "Workers waiting for a task")?,
            queued_tasks: int_gauge("tasks_queued", "Tasks waiting in the queue")?,
            running_tasks: int_gauge("tasks_running", "Tasks being executed")?,
            tasks_completed: int_gauge("tasks_completed", "Tasks that succeeded")?,
            tasks_failed: int_gauge("tasks_failed", "Tasks that failed")?,
            tasks_timed_out: int_gauge("tasks_timed_out", "Tasks that timed out")?,
            tasks_cancelled: int_gauge("tasks_cancelled", "Tasks that were cancelled")?,
            worker_failures: int_gauge("worker_failures", "Workers lost to crashes or limits")?,
            peak_memory: int_gauge("peak_memory_bytes", "Highest reported task memory")?,
            avg_task_seconds: gauge("avg_task_seconds", "Mean task execution time")?,
            error_rate: gauge("error_rate", "Failed tasks over processed tasks (0.0 to 1.0)")?,
            throughput: gauge("throughput", "Processed tasks per second")?,
            efficiency: gauge("efficiency", "Busy workers over pool size (0.0 to 1.0)")?,
            registry,
        })
    }

    /// Copy a metrics snapshot into the gauges.
    pub fn observe(&self, metrics: &PoolMetrics) {
        let clamp = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);

        self.pool_size.set(metrics.pool_size as i64);
        self.busy_workers.set(metrics.busy_workers as i64);
        self.idle_workers.set(metrics.idle_workers as i64);
        self.queued_tasks.set(metrics.queued_tasks as i64);
        self.running_tasks.set(metrics.running_tasks as i64);
        self.tasks_completed.set(clamp(metrics.completed));
        self.tasks_failed.set(clamp(metrics.failed));
        self.tasks_timed_out.set(clamp(metrics.timed_out));
        self.tasks_cancelled.set(clamp(metrics.cancelled));
        self.worker_failures.set(clamp(metrics.worker_failures));
        self.peak_memory.set(clamp(metrics.peak_memory));
        self.avg_task_seconds.set(
            metrics
                .avg_task_time
                .map(|avg| avg.as_secs_f64())
                .unwrap_or_default(),
        );
        self.error_rate.set(metrics.error_rate);
        self.throughput.set(metrics.throughput);
        self.efficiency.set(metrics.efficiency);
    }

    /// Text exposition of every gauge.
    pub fn render(&self) -> PoolResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// The underlying registry, for serving or merging.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
