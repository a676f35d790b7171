//! Configuration types for forgepool.
//!
//! A [`PoolConfig`] is built once and handed to [`crate::core::WorkerPool::new`];
//! the pool never mutates it afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for a worker pool.
///
/// # Examples
///
/// ```rust
/// use forgepool::config::{PoolConfig, WorkerConfig, LoadBalancing};
///
/// let config = PoolConfig {
///     workers: WorkerConfig::with_bounds(2, 8)
///         .with_load_balancing(LoadBalancing::LeastBusy)
///         .with_auto_scale(16),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker pool sizing, limits and recovery
    pub workers: WorkerConfig,

    /// Queue capacity and persistence
    pub queue: QueueConfig,

    /// Control loop timing
    pub engine: EngineConfig,

    /// Prometheus export
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pool never shrinks below this many workers
    pub min_workers: usize,

    /// Pool never grows beyond this many workers
    pub max_workers: usize,

    /// Idle workers above `min_workers` are evicted after this long (0 = never)
    pub idle_timeout_ms: u64,

    /// Default per-attempt execution timeout for tasks without their own
    pub task_timeout_ms: Option<u64>,

    /// Advisory retry ceiling for callers
    pub max_retries: u32,

    /// Memory a single worker may report before it is replaced
    pub memory_limit_bytes: Option<u64>,

    /// Fraction of `memory_limit_bytes` at which workers emit a warning
    pub memory_warning_ratio: f64,

    /// Wall-clock budget for one running attempt before the worker is replaced
    pub cpu_time_limit_ms: Option<u64>,

    /// How an idle worker is chosen for the next task
    pub load_balancing: LoadBalancing,

    /// Grow the pool while the queue is deep
    pub auto_scale: bool,

    /// Queue depth that triggers a scale-up
    pub scaling_threshold: usize,

    /// Replace workers that crash or exceed their limits
    pub restart_on_error: bool,

    /// Replace the worker when its task is timed out by the manager
    pub restart_on_timeout: bool,

    /// How long to wait for worker threads to exit on shutdown (in milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: num_cpus::get().max(1),
            idle_timeout_ms: 30_000, // 30 seconds
            task_timeout_ms: Some(300_000), // 5 minutes
            max_retries: 3,
            memory_limit_bytes: None,
            memory_warning_ratio: 0.8,
            cpu_time_limit_ms: None,
            load_balancing: LoadBalancing::RoundRobin,
            auto_scale: true,
            scaling_threshold: 10,
            restart_on_error: true,
            restart_on_timeout: true,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with explicit pool bounds.
    pub fn with_bounds(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    /// Set the default task timeout.
    pub fn with_task_timeout(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the idle eviction timeout.
    pub fn with_idle_timeout(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Set the load-balancing strategy.
    pub fn with_load_balancing(mut self, strategy: LoadBalancing) -> Self {
        self.load_balancing = strategy;
        self
    }

    /// Enable auto-scaling at the given queue depth.
    pub fn with_auto_scale(mut self, threshold: usize) -> Self {
        self.auto_scale = true;
        self.scaling_threshold = threshold;
        self
    }

    /// Disable auto-scaling.
    pub fn without_auto_scale(mut self) -> Self {
        self.auto_scale = false;
        self
    }

    /// Set the per-worker memory limit.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Set the per-attempt CPU time limit.
    pub fn with_cpu_time_limit(mut self, limit_ms: u64) -> Self {
        self.cpu_time_limit_ms = Some(limit_ms);
        self
    }

    /// Idle eviction timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| self.idle_timeout_ms.millis())
    }

    /// Default execution timeout, if any.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.filter(|ms| *ms > 0).map(u64::millis)
    }

    /// CPU time limit, if any.
    pub fn cpu_time_limit(&self) -> Option<Duration> {
        self.cpu_time_limit_ms.filter(|ms| *ms > 0).map(u64::millis)
    }
}

/// Strategy used to pick an idle worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    /// Rotate through idle workers
    #[default]
    RoundRobin,
    /// Idle worker with the fewest completed tasks
    LeastBusy,
    /// Uniformly random idle worker
    Random,
}

impl fmt::Display for LoadBalancing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancing::RoundRobin => "round-robin",
            LoadBalancing::LeastBusy => "least-busy",
            LoadBalancing::Random => "random",
        };
        f.write_str(name)
    }
}

impl FromStr for LoadBalancing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(LoadBalancing::RoundRobin),
            "least-busy" | "least_busy" | "leastbusy" => Ok(LoadBalancing::LeastBusy),
            "random" => Ok(LoadBalancing::Random),
            other => Err(format!("unknown load-balancing strategy '{other}'")),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queue size (0 = unlimited)
    pub max_queue_size: usize,

    /// Whether to snapshot pending tasks to disk
    pub enable_persistence: bool,

    /// Snapshot file path (only used if enable_persistence is true)
    pub persistence_path: Option<String>,

    /// How often the snapshot is rewritten (in seconds)
    pub persistence_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 0, // unlimited
            enable_persistence: false,
            persistence_path: None,
            persistence_interval_secs: 30,
        }
    }
}

impl QueueConfig {
    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }

    /// Enable snapshots to the given file.
    pub fn with_persistence(mut self, path: impl Into<String>) -> Self {
        self.enable_persistence = true;
        self.persistence_path = Some(path.into());
        self
    }

    /// Snapshot file, when persistence is on.
    pub fn snapshot_path(&self) -> Option<&str> {
        self.persistence_path
            .as_deref()
            .filter(|_| self.enable_persistence)
    }
}

/// Control loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Periodic dispatch tick (in milliseconds)
    pub tick_interval_ms: u64,

    /// How often workers are probed (in milliseconds)
    pub health_check_interval_ms: u64,

    /// How long a probe may go unanswered (in milliseconds)
    pub health_check_timeout_ms: u64,

    /// How often aggregate metrics are emitted (in seconds)
    pub metrics_interval_secs: u64,

    /// Grace period for in-flight tasks on shutdown (in milliseconds)
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 30_000,
            metrics_interval_secs: 30,
            graceful_shutdown_timeout_ms: 60_000, // 1 minute
        }
    }
}

impl EngineConfig {
    pub(crate) fn tick_interval(&self) -> Duration {
        self.tick_interval_ms.millis()
    }

    pub(crate) fn health_check_interval(&self) -> Duration {
        self.health_check_interval_ms.millis()
    }

    pub(crate) fn health_check_timeout(&self) -> Duration {
        self.health_check_timeout_ms.millis()
    }

    pub(crate) fn metrics_interval(&self) -> Duration {
        self.metrics_interval_secs.secs()
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        self.graceful_shutdown_timeout_ms.millis()
    }
}

/// Prometheus export configuration.
#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Mirror pool metrics into a Prometheus registry
    pub enable_prometheus: bool,

    /// Metric name prefix
    pub namespace: String,
}

#[cfg(feature = "metrics")]
impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: true,
            namespace: "forgepool".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

impl PoolConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                min_workers: 1,
                max_workers: 4,
                task_timeout_ms: Some(60_000),
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 1000,
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_ms: 5_000,
                metrics_interval_secs: 10,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig {
                enable_prometheus: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            workers: WorkerConfig {
                min_workers: cores,
                max_workers: cores * 2,
                idle_timeout_ms: 120_000,
                task_timeout_ms: Some(300_000),
                scaling_threshold: cores * 4,
                shutdown_timeout_ms: 30_000,
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 0, // unlimited
                enable_persistence: true,
                persistence_path: Some("forgepool-queue.json".to_string()),
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_ms: 15_000,
                health_check_timeout_ms: 60_000,
                graceful_shutdown_timeout_ms: 120_000,
                ..Default::default()
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig::default(),
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                min_workers: 1,
                max_workers: 2,
                idle_timeout_ms: 0,
                task_timeout_ms: Some(10_000),
                max_retries: 0,
                auto_scale: false,
                shutdown_timeout_ms: 2_000,
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 100,
                enable_persistence: false,
                ..Default::default()
            },
            engine: EngineConfig {
                tick_interval_ms: 10,
                health_check_interval_ms: 200,
                health_check_timeout_ms: 2_000,
                metrics_interval_secs: 1,
                graceful_shutdown_timeout_ms: 2_000,
            },
            #[cfg(feature = "metrics")]
            metrics: MetricsConfig {
                enable_prometheus: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let workers = &self.workers;

        if workers.max_workers == 0 {
            errors.push("Maximum workers must be greater than 0".to_string());
        }

        if workers.max_workers > 1000 {
            errors.push("Maximum workers should not exceed 1000".to_string());
        }

        if workers.min_workers > workers.max_workers {
            errors.push(format!(
                "Minimum workers ({}) must not exceed maximum workers ({})",
                workers.min_workers, workers.max_workers
            ));
        }

        if workers.auto_scale && workers.scaling_threshold == 0 {
            errors.push("Scaling threshold must be greater than 0 when auto-scaling".to_string());
        }

        if !(workers.memory_warning_ratio > 0.0 && workers.memory_warning_ratio <= 1.0) {
            errors.push("Memory warning ratio must be within (0, 1]".to_string());
        }

        if workers.memory_limit_bytes == Some(0) {
            errors.push("Memory limit must be greater than 0 when set".to_string());
        }

        if self.queue.enable_persistence && self.queue.persistence_path.is_none() {
            errors.push("Persistence path is required when persistence is enabled".to_string());
        }

        if self.queue.enable_persistence && self.queue.persistence_interval_secs == 0 {
            errors.push("Persistence interval must be greater than 0".to_string());
        }

        if self.engine.tick_interval_ms == 0 {
            errors.push("Tick interval must be greater than 0".to_string());
        }

        if self.engine.health_check_interval_ms == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if self.engine.health_check_timeout_ms == 0 {
            errors.push("Health check timeout must be greater than 0".to_string());
        }

        if self.engine.metrics_interval_secs == 0 {
            errors.push("Metrics interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
