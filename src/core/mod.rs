//! The worker pool and its public handle.
//!
//! [`WorkerPool`] is the owner-facing API. It validates configuration, starts
//! the control loop and forwards every request to it; the loop itself lives in
//! [`engine`] and is the only place where pool state changes.

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::metrics::{PoolMetrics, WorkerInfo};
use crate::queue::{QueueStats, RestoreReport, load_snapshot};
use crate::task::{Task, TaskId, TaskOutcome};
use crate::utils::as_millis_u64;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

#[cfg(feature = "metrics")]
use crate::metrics::PrometheusExporter;

pub mod balancer;
pub mod engine;
pub mod registry;
pub mod worker;

pub use balancer::{LoadBalancer, WorkerCandidate};
pub use engine::{PoolEvent, ShutdownSummary};
pub use registry::{FnHandler, HandlerId, HandlerRegistry, TaskHandler, TypedHandler};
pub use worker::{TaskContext, WorkerExitCause, WorkerLimits, WorkerStatus};

use engine::{CancelReason, PoolCommand, PoolEngine};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 1024;

/// A pool of isolated worker threads fed from a priority queue.
///
/// # Examples
///
/// ```rust
/// use forgepool::prelude::*;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> PoolResult<()> {
///     let mut registry = HandlerRegistry::new();
///     registry.register_fn("double", |payload, _ctx| async move {
///         Ok::<_, PoolError>(json!(payload.as_i64().unwrap_or_default() * 2))
///     })?;
///
///     let pool = WorkerPool::new(PoolConfig::testing(), registry)?;
///     pool.start().await?;
///
///     let outcome = pool.submit(Task::new("double", 21)).await?.await?;
///     assert_eq!(outcome.output::<i64>()?, 42);
///
///     pool.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct WorkerPool {
    config: PoolConfig,
    registry: Arc<HandlerRegistry>,
    commands: RwLock<Option<mpsc::UnboundedSender<PoolCommand>>>,
    control: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<PoolEvent>,
    shutting_down: Arc<AtomicBool>,
    #[cfg(feature = "metrics")]
    exporter: Option<PrometheusExporter>,
}

impl WorkerPool {
    /// Create a stopped pool. The configuration is validated here.
    pub fn new(config: PoolConfig, registry: HandlerRegistry) -> PoolResult<Self> {
        config
            .validate()
            .map_err(|errors| PoolError::config(errors.join("; ")))?;

        #[cfg(feature = "metrics")]
        let exporter = if config.metrics.enable_prometheus {
            Some(PrometheusExporter::new(&config.metrics.namespace)?)
        } else {
            None
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            commands: RwLock::new(None),
            control: Mutex::new(None),
            events,
            shutting_down: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "metrics")]
            exporter,
        })
    }

    /// Spawn the initial workers and start the control loop.
    ///
    /// When persistence is enabled the last queue snapshot is reloaded through
    /// the same checks as [`WorkerPool::submit`]; the report lists what was
    /// rejected.
    pub async fn start(&self) -> PoolResult<RestoreReport> {
        let mut commands = self.commands.write().await;
        if commands.is_some() {
            return Err(PoolError::AlreadyRunning);
        }

        let (engine, worker_events) = PoolEngine::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            self.events.clone(),
            Arc::clone(&self.shutting_down),
        );
        #[cfg(feature = "metrics")]
        let engine = engine.with_exporter(self.exporter.clone());
        let mut engine = engine;
        engine.spawn_initial_workers()?;

        let report = match self.config.queue.snapshot_path().map(PathBuf::from) {
            Some(path) => {
                let records = tokio::task::spawn_blocking(move || load_snapshot(path))
                    .await
                    .map_err(|e| PoolError::config(format!("failed to load queue snapshot: {e}")))??;
                engine.restore(records)
            }
            None => RestoreReport::default(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.shutting_down.store(false, Ordering::Release);
        *self.control.lock().await = Some(tokio::spawn(engine.run(rx, worker_events)));
        *commands = Some(tx);

        tracing::info!(
            "🔨 Pool started with {} handlers ({} task types)",
            self.registry.len(),
            self.registry.task_types().join(", ")
        );
        Ok(report)
    }

    /// Queue a task and return a handle resolving to its outcome.
    ///
    /// Validation, duplicate, unknown-type and capacity errors are returned
    /// here; everything after acceptance arrives through the handle.
    pub async fn submit(&self, task: Task) -> PoolResult<TaskHandle> {
        let commands = self.sender().await?;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        let task_id = task.id.clone();
        let (responder, receiver) = oneshot::channel();
        let (reply, accepted) = oneshot::channel();
        commands
            .send(PoolCommand::Submit {
                task,
                responder,
                reply,
            })
            .map_err(|_| PoolError::NotRunning)?;
        accepted.await.map_err(|_| PoolError::NotRunning)??;

        Ok(TaskHandle {
            task_id,
            receiver,
            commands: commands.downgrade(),
        })
    }

    /// Cancel a task. Returns `false` if it already finished or is unknown.
    ///
    /// A queued task is removed and resolves as cancelled. A running task is
    /// failed from the pool's side; its worker keeps running it until the
    /// worker is retired or the task ends on its own.
    pub async fn cancel(&self, task_id: &str) -> PoolResult<bool> {
        let task_id = task_id.to_string();
        self.request(|reply| PoolCommand::Cancel {
            task_id,
            reason: CancelReason::Requested,
            reply: Some(reply),
        })
        .await
    }

    /// Resize the pool. Returns the resulting size.
    ///
    /// Only idle workers are removed when shrinking, so the result can stay
    /// above `target` while workers are busy.
    pub async fn scale_pool(&self, target: usize) -> PoolResult<usize> {
        self.request(|reply| PoolCommand::Scale { target, reply })
            .await?
    }

    /// Aggregated pool metrics
    pub async fn get_metrics(&self) -> PoolResult<PoolMetrics> {
        self.request(|reply| PoolCommand::Metrics { reply }).await
    }

    /// Snapshot of every live worker
    pub async fn get_worker_info(&self) -> PoolResult<Vec<WorkerInfo>> {
        self.request(|reply| PoolCommand::WorkerInfo { reply }).await
    }

    /// Current queue statistics
    pub async fn queue_stats(&self) -> PoolResult<QueueStats> {
        self.request(|reply| PoolCommand::QueueStats { reply }).await
    }

    /// Receive pool events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Stop accepting tasks, drain within the grace period, then stop workers.
    pub async fn shutdown(&self) -> PoolResult<ShutdownSummary> {
        let commands = self.sender().await?;
        self.shutting_down.store(true, Ordering::Release);

        let (reply, summary) = oneshot::channel();
        commands
            .send(PoolCommand::Shutdown { reply })
            .map_err(|_| PoolError::NotRunning)?;
        drop(commands);
        let summary = summary.await.map_err(|_| PoolError::NotRunning)?;

        self.commands.write().await.take();
        if let Some(control) = self.control.lock().await.take() {
            if let Err(e) = control.await {
                tracing::error!("🔨 Pool control loop ended abnormally: {}", e);
            }
        }

        tracing::info!("🔨 Pool stopped");
        Ok(summary)
    }

    /// Wait for Ctrl+C, then shut down gracefully.
    pub async fn wait_for_shutdown(&self) -> PoolResult<ShutdownSummary> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("🔨 Received Ctrl+C, initiating graceful shutdown...");
        self.shutdown().await
    }

    /// Whether the control loop is running.
    pub async fn is_running(&self) -> bool {
        self.commands.read().await.is_some()
    }

    /// The configuration this pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Registered handlers
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Prometheus gauges, when enabled in the configuration.
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub fn prometheus(&self) -> Option<&PrometheusExporter> {
        self.exporter.as_ref()
    }

    async fn sender(&self) -> PoolResult<mpsc::UnboundedSender<PoolCommand>> {
        self.commands
            .read()
            .await
            .clone()
            .ok_or(PoolError::NotRunning)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> PoolResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender()
            .await?
            .send(command(reply))
            .map_err(|_| PoolError::NotRunning)?;
        response.await.map_err(|_| PoolError::NotRunning)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // dropping the last sender makes the control loop shut down on its own
        if self.commands.get_mut().is_some() {
            tracing::warn!(
                "🔨 WorkerPool dropped while running. Call shutdown() explicitly to get a summary."
            );
        }
    }
}

/// Resolves to the outcome of one submitted task.
///
/// Awaiting the handle waits without limit; [`TaskHandle::wait_timeout`]
/// bounds the total submit-to-result time.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<TaskOutcome>,
    commands: mpsc::WeakUnboundedSender<PoolCommand>,
}

impl TaskHandle {
    /// Id of the submitted task
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> PoolResult<TaskOutcome> {
        self.await
    }

    /// Wait at most `limit` for the outcome.
    ///
    /// On expiry the pool is asked to time the task out, and this returns
    /// [`PoolError::Timeout`].
    pub async fn wait_timeout(mut self, limit: Duration) -> PoolResult<TaskOutcome> {
        match tokio::time::timeout(limit, &mut self.receiver).await {
            Ok(outcome) => outcome.map_err(|_| PoolError::NotRunning),
            Err(_) => {
                if let Some(commands) = self.commands.upgrade() {
                    let _ = commands.send(PoolCommand::Cancel {
                        task_id: self.task_id.clone(),
                        reason: CancelReason::SubmissionTimeout(limit),
                        reply: None,
                    });
                }
                Err(PoolError::Timeout {
                    timeout_ms: as_millis_u64(limit),
                })
            }
        }
    }
}

impl Future for TaskHandle {
    type Output = PoolResult<TaskOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.map_err(|_| PoolError::NotRunning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskErrorKind, TaskPriority, TaskStatus};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::time::{Instant, sleep, timeout};
    use tokio_test::{assert_err, assert_ok, assert_pending};

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("echo", |payload, _ctx| async move { Ok::<_, PoolError>(payload) })
            .unwrap();
        registry
            .register_fn("sleep", |payload: Value, ctx: TaskContext| async move {
                let millis = payload.as_u64().unwrap_or_default();
                ctx.report_progress(50.0);
                sleep(Duration::from_millis(millis)).await;
                Ok::<_, PoolError>(json!(millis))
            })
            .unwrap();
        registry
            .register_fn("fail", |_payload, _ctx| async move {
                Err::<Value, _>(PoolError::task_execution("unbalanced equation", None))
            })
            .unwrap();
        registry
            .register_fn("crash", |_payload, _ctx| async move {
                let crash = true;
                if crash {
                    panic!("simulated worker crash");
                }
                Ok::<_, PoolError>(Value::Null)
            })
            .unwrap();
        registry
            .register_fn("spin", |payload: Value, _ctx| async move {
                // no await point while it runs
                std::thread::sleep(Duration::from_millis(payload.as_u64().unwrap_or_default()));
                Ok::<_, PoolError>(payload)
            })
            .unwrap();
        registry
            .register_fn("leaky", |_payload, ctx: TaskContext| async move {
                sleep(Duration::from_millis(300)).await;
                ctx.report_memory(5_000);
                sleep(Duration::from_millis(200)).await;
                Ok::<_, PoolError>(Value::Null)
            })
            .unwrap();
        registry
            .register_fn("hog", |_payload, ctx: TaskContext| async move {
                ctx.report_memory(2_000);
                sleep(Duration::from_millis(500)).await;
                Ok::<_, PoolError>(Value::Null)
            })
            .unwrap();
        registry
    }

    fn config(min_workers: usize, max_workers: usize) -> PoolConfig {
        let mut config = PoolConfig::testing();
        config.workers.min_workers = min_workers;
        config.workers.max_workers = max_workers;
        config
    }

    fn task(id: &str, task_type: &str, data: Value) -> Task {
        Task::builder()
            .with_id(id)
            .with_type(task_type)
            .with_data(data)
            .build()
            .unwrap()
    }

    async fn started(config: PoolConfig) -> WorkerPool {
        let ready = config.workers.min_workers;
        let pool = WorkerPool::new(config, registry()).unwrap();
        pool.start().await.unwrap();
        eventually(&pool, |m| m.idle_workers >= ready).await;
        pool
    }

    async fn eventually(pool: &WorkerPool, check: impl Fn(&PoolMetrics) -> bool) -> PoolMetrics {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let metrics = pool.get_metrics().await.unwrap();
            if check(&metrics) {
                return metrics;
            }
            assert!(Instant::now() < deadline, "condition not reached: {metrics:?}");
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn next_started(events: &mut broadcast::Receiver<PoolEvent>) -> TaskId {
        let found = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(PoolEvent::TaskStarted { task_id, .. }) => return task_id,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await;
        found.expect("task started")
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let pool = WorkerPool::new(config(1, 2), registry()).unwrap();
        assert!(!pool.is_running().await);
        assert!(matches!(
            pool.submit(Task::new("echo", 1)).await,
            Err(PoolError::NotRunning)
        ));

        assert_ok!(pool.start().await);
        assert!(pool.is_running().await);
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        let summary = pool.shutdown().await.unwrap();
        assert!(summary.clean);
        assert_eq!(summary.workers_terminated, 1);
        assert!(!pool.is_running().await);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let Err(err) = WorkerPool::new(config(3, 2), registry()) else {
            panic!("min above max was accepted");
        };
        assert!(matches!(err, PoolError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let pool = started(config(1, 2)).await;

        let outcome = pool
            .submit(task("t1", "echo", json!({"x": 1})))
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.result, Some(json!({"x": 1})));
        assert_eq!(outcome.worker_id, Some(0));
        assert!(outcome.execution_time.is_some());

        let metrics = pool.get_metrics().await.unwrap();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.task_types["echo"].completed, 1);

        let workers = pool.get_worker_info().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].tasks_completed, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_follows_priority() {
        let pool = started(config(1, 1)).await;
        let mut events = pool.subscribe();

        let blocker = pool.submit(task("blocker", "sleep", json!(200))).await.unwrap();
        assert_eq!(next_started(&mut events).await, "blocker");

        let mut handles = vec![blocker];
        for (id, priority) in [
            ("low", TaskPriority::Low),
            ("high-1", TaskPriority::High),
            ("normal", TaskPriority::Normal),
            ("high-2", TaskPriority::High),
        ] {
            let task = Task::builder()
                .with_id(id)
                .with_type("echo")
                .with_data(id)
                .with_priority(priority)
                .build()
                .unwrap();
            handles.push(pool.submit(task).await.unwrap());
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(next_started(&mut events).await);
        }
        assert_eq!(order, ["high-1", "high-2", "normal", "low"]);

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejections_at_submit() {
        let pool = started(config(1, 1)).await;

        let running = pool.submit(task("dup", "sleep", json!(200))).await.unwrap();
        let err = assert_err!(pool.submit(task("dup", "echo", json!(1))).await);
        assert!(matches!(err, PoolError::DuplicateTask { .. }));

        let err = assert_err!(pool.submit(Task::new("nope", 1)).await);
        assert!(matches!(err, PoolError::UnknownTaskType { .. }));
        assert!(err.is_validation());

        assert!(running.await.unwrap().success);
        // the id is free again once the task finished
        assert_ok!(pool.submit(task("dup", "echo", json!(1))).await);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_and_shutdown_fails_queued() {
        let mut config = config(0, 1);
        config.queue.max_queue_size = 2;
        config.engine.graceful_shutdown_timeout_ms = 100;
        let pool = started(config).await;

        let first = pool.submit(task("a", "echo", json!(1))).await.unwrap();
        let second = pool.submit(task("b", "echo", json!(2))).await.unwrap();
        let err = assert_err!(pool.submit(task("c", "echo", json!(3))).await);
        assert!(matches!(err, PoolError::QueueFull { max_size: 2 }));

        let summary = pool.shutdown().await.unwrap();
        assert_eq!(summary.failed_on_shutdown, 2);
        assert!(!summary.clean);

        for handle in [first, second] {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.error.unwrap().kind, TaskErrorKind::Shutdown);
            assert_eq!(outcome.status, TaskStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_execution_error_is_delivered() {
        let pool = started(config(1, 1)).await;

        let outcome = pool.submit(Task::new("fail", 0)).await.unwrap().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, TaskStatus::Failed);
        let error = outcome.error.clone().unwrap();
        assert_eq!(error.kind, TaskErrorKind::Execution);
        assert!(error.message.contains("unbalanced equation"));
        assert!(matches!(
            outcome.into_result(),
            Err(PoolError::TaskFailed { .. })
        ));

        // the worker survives handler errors
        let metrics = pool.get_metrics().await.unwrap();
        assert_eq!(metrics.worker_failures, 0);
        assert_eq!(metrics.pool_size, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_fails_task_once_and_restores_pool() {
        let pool = started(config(2, 2)).await;
        let mut events = pool.subscribe();

        let survivor = pool.submit(task("survivor", "sleep", json!(300))).await.unwrap();
        let crashed = pool.submit(task("crashed", "crash", Value::Null)).await.unwrap();

        let outcome = crashed.await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().kind, TaskErrorKind::WorkerLost);

        assert!(survivor.await.unwrap().success);
        let metrics = eventually(&pool, |m| m.pool_size == 2 && m.idle_workers == 2).await;
        assert_eq!(metrics.worker_failures, 1);
        assert_eq!(metrics.workers_spawned, 3);

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, PoolEvent::TaskFinished(o) if o.task_id == "crashed") {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_execution_timeout_replaces_worker() {
        let mut config = config(1, 1);
        config.workers.task_timeout_ms = Some(100);
        let pool = started(config).await;

        let outcome = pool
            .submit(task("slow", "sleep", json!(5_000)))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Timeout);
        assert_eq!(outcome.error.unwrap().kind, TaskErrorKind::Timeout);
        assert_eq!(outcome.worker_id, Some(0));

        let metrics = eventually(&pool, |m| m.idle_workers == 1 && m.workers_spawned == 2).await;
        assert_eq!(metrics.timed_out, 1);
        assert_eq!(metrics.pool_size, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_limit_fails_task() {
        let mut config = config(1, 1);
        config.workers.memory_limit_bytes = Some(1_000);
        let pool = started(config).await;

        let outcome = pool.submit(Task::new("hog", 0)).await.unwrap().await.unwrap();
        assert_eq!(outcome.error.unwrap().kind, TaskErrorKind::ResourceLimit);

        let metrics = eventually(&pool, |m| m.idle_workers == 1).await;
        assert_eq!(metrics.worker_failures, 1);
        assert!(metrics.peak_memory >= 2_000);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_task_times_out_without_workers() {
        let mut config = config(0, 1);
        config.engine.graceful_shutdown_timeout_ms = 100;
        let pool = started(config).await;

        let task = Task::builder()
            .with_type("echo")
            .with_data(1)
            .with_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let started_at = Instant::now();
        let outcome = pool.submit(task).await.unwrap().await.unwrap();
        assert!(started_at.elapsed() >= Duration::from_millis(50));
        assert_eq!(outcome.status, TaskStatus::Timeout);
        assert_eq!(outcome.worker_id, None);

        let stats = pool.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_expired, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let mut config = config(0, 1);
        config.engine.graceful_shutdown_timeout_ms = 100;
        let pool = started(config).await;

        let handle = pool.submit(task("c1", "echo", json!(1))).await.unwrap();
        assert!(pool.cancel("c1").await.unwrap());
        assert!(!pool.cancel("c1").await.unwrap());

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.error.unwrap().kind, TaskErrorKind::Cancelled);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_bounds_and_busy_workers() {
        let pool = started(config(1, 3)).await;

        assert_eq!(pool.scale_pool(3).await.unwrap(), 3);
        assert!(matches!(
            pool.scale_pool(4).await,
            Err(PoolError::ScaleOutOfRange { target: 4, min: 1, max: 3 })
        ));
        assert!(matches!(
            pool.scale_pool(0).await,
            Err(PoolError::ScaleOutOfRange { .. })
        ));
        eventually(&pool, |m| m.idle_workers == 3).await;

        let a = pool.submit(task("a", "sleep", json!(400))).await.unwrap();
        let b = pool.submit(task("b", "sleep", json!(400))).await.unwrap();
        eventually(&pool, |m| m.busy_workers == 2).await;

        // only the idle worker can go
        assert_eq!(pool.scale_pool(1).await.unwrap(), 2);
        assert!(a.await.unwrap().success);
        assert!(b.await.unwrap().success);

        assert_eq!(pool.scale_pool(1).await.unwrap(), 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_autoscale_under_backlog() {
        let mut config = config(1, 4);
        config.workers.auto_scale = true;
        config.workers.scaling_threshold = 5;
        let pool = started(config).await;

        let mut handles = Vec::new();
        for i in 0..6 {
            handles.push(
                pool.submit(task(&format!("job-{i}"), "sleep", json!(300)))
                    .await
                    .unwrap(),
            );
        }

        let metrics = eventually(&pool, |m| m.pool_size > 1).await;
        assert!(metrics.pool_size <= 4);

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert!(pool.get_metrics().await.unwrap().pool_size <= 4);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_autoscale_waits_for_tick() {
        let mut config = config(1, 4);
        config.workers.auto_scale = true;
        config.workers.scaling_threshold = 2;
        config.engine.tick_interval_ms = 300;
        let pool = started(config).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(
                pool.submit(task(&format!("burst-{i}"), "sleep", json!(400)))
                    .await
                    .unwrap(),
            );
        }
        // a burst of submissions does not spawn anything by itself
        assert_eq!(pool.get_metrics().await.unwrap().pool_size, 1);

        let grown = eventually(&pool, |m| m.pool_size > 1).await;
        assert!(grown.pool_size < 4);
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_handler_is_not_reported_lost() {
        let mut config = config(1, 1);
        config.engine.health_check_interval_ms = 50;
        config.engine.health_check_timeout_ms = 300;
        let pool = started(config).await;

        let outcome = pool
            .submit(task("blocking", "spin", json!(1_200)))
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);

        let metrics = eventually(&pool, |m| m.idle_workers == 1).await;
        assert_eq!(metrics.worker_failures, 0);
        assert_eq!(metrics.workers_spawned, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_idle_worker_is_replaced() {
        let mut config = config(1, 1);
        config.workers.task_timeout_ms = Some(100);
        config.workers.restart_on_timeout = false;
        config.engine.health_check_interval_ms = 50;
        config.engine.health_check_timeout_ms = 300;
        let pool = started(config).await;
        let mut events = pool.subscribe();

        // the worker is released on timeout but stays stuck in the handler
        let outcome = pool
            .submit(task("stuck", "spin", json!(1_500)))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Timeout);

        let reason = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PoolEvent::WorkerFailed { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert!(reason.contains("unresponsive"), "{reason}");

        let metrics = eventually(&pool, |m| m.idle_workers == 1 && m.workers_spawned == 2).await;
        assert_eq!(metrics.worker_failures, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cpu_time_limit_replaces_worker() {
        let mut config = config(1, 1);
        config.workers.cpu_time_limit_ms = Some(100);
        let pool = started(config).await;

        let outcome = pool
            .submit(task("long", "sleep", json!(5_000)))
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().kind, TaskErrorKind::ResourceLimit);
        assert_eq!(outcome.worker_id, Some(0));

        let metrics = eventually(&pool, |m| m.idle_workers == 1 && m.workers_spawned == 2).await;
        assert_eq!(metrics.pool_size, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_task_memory_spares_next_task() {
        let mut config = config(1, 1);
        config.workers.memory_limit_bytes = Some(1_000);
        config.workers.restart_on_timeout = false;
        let pool = started(config).await;

        let leaky = Task::builder()
            .with_id("leaky")
            .with_type("leaky")
            .with_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let outcome = pool.submit(leaky).await.unwrap().await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Timeout);

        // lands on the same worker while the leaky handler is still running
        let small = pool.submit(task("small", "echo", json!(1))).await.unwrap();
        let outcome = small.await.unwrap();
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.worker_id, Some(0));

        let metrics = eventually(&pool, |m| m.idle_workers == 1 && m.workers_spawned == 2).await;
        assert_eq!(metrics.worker_failures, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_timeout_times_out_task() {
        let pool = started(config(1, 1)).await;

        let handle = pool.submit(task("w1", "sleep", json!(5_000))).await.unwrap();
        let err = assert_err!(handle.wait_timeout(Duration::from_millis(50)).await);
        assert!(matches!(err, PoolError::Timeout { timeout_ms: 50 }));

        let metrics = eventually(&pool, |m| m.timed_out == 1 && m.idle_workers == 1).await;
        assert_eq!(metrics.running_tasks, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_tasks() {
        let pool = started(config(1, 1)).await;
        let mut events = pool.subscribe();

        let handle = pool.submit(task("s1", "sleep", json!(150))).await.unwrap();
        next_started(&mut events).await;

        let summary = pool.shutdown().await.unwrap();
        assert_eq!(summary.completed_during_grace, 1);
        assert_eq!(summary.failed_on_shutdown, 0);
        assert!(summary.clean);
        assert!(handle.await.unwrap().success);

        assert!(matches!(
            pool.submit(Task::new("echo", 1)).await,
            Err(PoolError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        let mut config = config(0, 1);
        config.engine.graceful_shutdown_timeout_ms = 100;
        config.queue.enable_persistence = true;
        config.queue.persistence_path = Some(path.display().to_string());

        let pool = started(config.clone()).await;
        pool.submit(task("p1", "echo", json!(1))).await.unwrap();
        pool.submit(task("p2", "echo", json!(2))).await.unwrap();
        let summary = pool.shutdown().await.unwrap();
        assert!(summary.persisted);
        assert!(path.exists());

        config.workers.min_workers = 1;
        let restarted = WorkerPool::new(config, registry()).unwrap();
        let report = restarted.start().await.unwrap();
        assert_eq!(report.restored, 2);
        assert!(report.rejected.is_empty());

        eventually(&restarted, |m| m.completed == 2).await;
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_workers_are_evicted() {
        let mut config = config(1, 3);
        config.workers.idle_timeout_ms = 100;
        let pool = started(config).await;

        assert_eq!(pool.scale_pool(3).await.unwrap(), 3);
        let metrics = eventually(&pool, |m| m.pool_size == 1).await;
        assert_eq!(metrics.workers_spawned, 3);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_events_and_pending_handle() {
        let pool = started(config(1, 1)).await;
        let mut events = pool.subscribe();

        let handle = pool.submit(task("p", "sleep", json!(200))).await.unwrap();
        assert_eq!(handle.task_id(), "p");
        let mut polled = tokio_test::task::spawn(handle);
        assert_pending!(polled.poll());

        let progress = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PoolEvent::TaskProgress { progress, .. }) = events.recv().await {
                    return progress;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(progress, 50.0);

        drop(polled);
        pool.shutdown().await.unwrap();
    }
}
