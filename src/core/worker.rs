//! Worker execution harness.
//!
//! Each worker is a dedicated OS thread running its own single-threaded tokio
//! runtime. It shares nothing with the manager: it receives
//! [`ManagerMessage`]s on its inbox, runs one task at a time through the
//! handler table it was given at startup, and reports back with
//! [`WorkerMessage`]s.

use crate::core::registry::{HandlerId, TaskHandler};
use crate::error::PoolResult;
use crate::metrics::WorkerInfo;
use crate::protocol::{Envelope, ManagerMessage, WorkerId, WorkerMessage};
use crate::task::{Task, TaskError, TaskErrorKind, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Thread spawned, waiting for `worker-ready`
    Starting,
    /// Ready for a task
    Idle,
    /// Running exactly one task
    Busy,
    /// Crashed, unresponsive or over its limits; about to be removed
    Error,
    /// Stopped
    Terminated,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Error => "ERROR",
            WorkerStatus::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Why a worker thread ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExitCause {
    /// Shutdown requested or inbox closed
    Normal,
    /// A handler panicked
    Panic(String),
    /// The worker could not build its runtime
    RuntimeError(String),
}

/// Everything a worker tells the manager
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message {
        worker_id: WorkerId,
        envelope: Envelope<WorkerMessage>,
    },
    Exited {
        worker_id: WorkerId,
        cause: WorkerExitCause,
    },
}

/// Resource limits a worker enforces on itself
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerLimits {
    /// Reported usage above this is a resource-limit failure
    pub memory_limit: Option<u64>,
    /// Fraction of the limit at which a warning is sent
    pub memory_warning_ratio: f64,
}

#[derive(Debug)]
struct MemoryTracker {
    current: AtomicU64,
    peak: AtomicU64,
    level: AtomicU8,
    limit: Option<u64>,
    warning_at: Option<u64>,
}

impl MemoryTracker {
    fn new(limits: WorkerLimits) -> Self {
        Self {
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            level: AtomicU8::new(0),
            limit: limits.memory_limit,
            warning_at: limits
                .memory_limit
                .map(|limit| (limit as f64 * limits.memory_warning_ratio) as u64),
        }
    }

    fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
        self.level.store(0, Ordering::Relaxed);
    }

    /// Returns the limit when usage crossed into a higher warning level.
    fn record(&self, bytes: u64) -> Option<u64> {
        self.current.store(bytes, Ordering::Relaxed);
        self.peak.fetch_max(bytes, Ordering::Relaxed);

        let limit = self.limit?;
        let warning_at = self.warning_at.unwrap_or(limit);
        let level = if bytes > limit {
            2
        } else if bytes >= warning_at {
            1
        } else {
            return None;
        };

        let previous = self.level.fetch_max(level, Ordering::Relaxed);
        (level > previous).then_some(limit)
    }

    fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Handle given to a handler for the task it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    worker_id: WorkerId,
    metadata: Arc<HashMap<String, Value>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    memory: Arc<MemoryTracker>,
}

impl TaskContext {
    /// A context not attached to any pool; reports go nowhere.
    ///
    /// Useful for calling handlers directly in tests.
    pub fn detached(task_id: impl Into<TaskId>) -> Self {
        let (events, _) = mpsc::unbounded_channel();
        Self {
            task_id: task_id.into(),
            worker_id: 0,
            metadata: Arc::new(HashMap::new()),
            events,
            memory: Arc::new(MemoryTracker::new(WorkerLimits::default())),
        }
    }

    /// Id of the running task
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Id of the worker running it
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Metadata attached to the task
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Report progress in percent. Values are clamped to `0..=100`.
    pub fn report_progress(&self, progress: f32) {
        if progress.is_nan() {
            return;
        }
        self.send(WorkerMessage::TaskProgress {
            progress: progress.clamp(0.0, 100.0),
        });
    }

    /// Report current memory usage in bytes.
    ///
    /// Crossing the warning ratio, and later the limit itself, each send one
    /// `memory-warning` to the manager.
    pub fn report_memory(&self, bytes: u64) {
        if let Some(limit) = self.memory.record(bytes) {
            self.send(WorkerMessage::MemoryWarning {
                usage: bytes,
                limit,
            });
        }
    }

    /// Last reported memory usage
    pub fn memory_usage(&self) -> u64 {
        self.memory.current()
    }

    fn send(&self, payload: WorkerMessage) {
        let _ = self.events.send(WorkerEvent::Message {
            worker_id: self.worker_id,
            envelope: Envelope::new(Some(self.task_id.clone()), payload),
        });
    }
}

/// Manager-side handle to a spawned worker
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) inbox: mpsc::UnboundedSender<Envelope<ManagerMessage>>,
    pub(crate) thread: std::thread::JoinHandle<()>,
}

/// Start a worker thread.
pub(crate) fn spawn_worker(
    id: WorkerId,
    handlers: Arc<[Arc<dyn TaskHandler>]>,
    limits: WorkerLimits,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> PoolResult<WorkerHandle> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

    let thread = std::thread::Builder::new()
        .name(format!("forgepool-worker-{id}"))
        .spawn(move || {
            let mut guard = ExitGuard {
                worker_id: id,
                events: events.clone(),
                cause: WorkerExitCause::Panic("worker thread unwound".to_string()),
            };

            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("🔨 Worker {} could not start its runtime: {}", id, e);
                    guard.cause = WorkerExitCause::RuntimeError(e.to_string());
                    return;
                }
            };

            let worker = Worker::new(id, handlers, limits, events);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                runtime.block_on(worker.run(inbox_rx))
            }));

            guard.cause = match outcome {
                Ok(()) => WorkerExitCause::Normal,
                Err(payload) => WorkerExitCause::Panic(panic_message(payload.as_ref())),
            };
        })?;

    Ok(WorkerHandle {
        inbox: inbox_tx,
        thread,
    })
}

/// Reports the thread's exit however it ends.
struct ExitGuard {
    worker_id: WorkerId,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cause: WorkerExitCause,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let cause = std::mem::replace(&mut self.cause, WorkerExitCause::Normal);
        let _ = self.events.send(WorkerEvent::Exited {
            worker_id: self.worker_id,
            cause,
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Worker {
    id: WorkerId,
    handlers: Arc<[Arc<dyn TaskHandler>]>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    memory: Arc<MemoryTracker>,
    backlog: VecDeque<(Task, HandlerId)>,
}

impl Worker {
    fn new(
        id: WorkerId,
        handlers: Arc<[Arc<dyn TaskHandler>]>,
        limits: WorkerLimits,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            handlers,
            events,
            memory: Arc::new(MemoryTracker::new(limits)),
            backlog: VecDeque::new(),
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope<ManagerMessage>>) {
        tracing::info!(
            "🔨 Worker {} ready with {} handlers",
            self.id,
            self.handlers.len()
        );
        self.send(None, WorkerMessage::WorkerReady);

        loop {
            if let Some((task, handler)) = self.backlog.pop_front() {
                if !self.execute(task, handler, &mut inbox).await {
                    break;
                }
                continue;
            }

            let Some(envelope) = inbox.recv().await else {
                break;
            };
            match envelope.payload {
                ManagerMessage::TaskAssignment { task, handler } => {
                    if !self.execute(task, handler, &mut inbox).await {
                        break;
                    }
                }
                ManagerMessage::HealthCheck { seq } => self.answer_health_check(seq),
                ManagerMessage::WorkerShutdown => break,
            }
        }

        tracing::info!("🔨 Worker {} stopped", self.id);
    }

    /// Run one task. Returns `false` when the worker must stop.
    async fn execute(
        &mut self,
        task: Task,
        handler: HandlerId,
        inbox: &mut mpsc::UnboundedReceiver<Envelope<ManagerMessage>>,
    ) -> bool {
        let task_id = task.id.clone();
        let Some(handler) = self.handlers.get(handler.index()).cloned() else {
            self.send(
                Some(task_id),
                WorkerMessage::TaskError {
                    error: TaskError::new(
                        TaskErrorKind::Execution,
                        format!("no handler for task type '{}'", task.task_type),
                    ),
                    execution_time: Duration::ZERO,
                    memory_usage: 0,
                },
            );
            return true;
        };

        tracing::debug!(
            "🔨 Worker {} forging task {} ({})",
            self.id,
            task_id,
            task.task_type
        );

        let baseline = serde_json::to_vec(&task.data)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);
        self.memory.reset();
        let ctx = TaskContext {
            task_id: task_id.clone(),
            worker_id: self.id,
            metadata: Arc::new(task.metadata),
            events: self.events.clone(),
            memory: Arc::clone(&self.memory),
        };
        ctx.report_memory(baseline);

        let started = Instant::now();
        let mut execution = handler.execute(task.data, ctx);
        let mut keep_running = true;

        let result = loop {
            tokio::select! {
                result = &mut execution => break Some(result),
                message = inbox.recv() => match message.map(|envelope| envelope.payload) {
                    Some(ManagerMessage::HealthCheck { seq }) => self.answer_health_check(seq),
                    Some(ManagerMessage::TaskAssignment { task, handler }) => {
                        tracing::warn!(
                            "🔨 Worker {} got task {} while busy, buffering it",
                            self.id,
                            task.id
                        );
                        self.backlog.push_back((task, handler));
                    }
                    Some(ManagerMessage::WorkerShutdown) | None => {
                        keep_running = false;
                        break None;
                    }
                },
            }
        };

        let execution_time = started.elapsed();
        let memory_usage = self.memory.peak();
        match result {
            Some(Ok(value)) => {
                tracing::debug!(
                    "🔨 Worker {} completed task {} in {:?}",
                    self.id,
                    task_id,
                    execution_time
                );
                self.send(
                    Some(task_id),
                    WorkerMessage::TaskResult {
                        result: value,
                        execution_time,
                        memory_usage,
                    },
                );
            }
            Some(Err(error)) => {
                tracing::warn!("🔨 Worker {} task {} failed: {}", self.id, task_id, error);
                self.send(
                    Some(task_id),
                    WorkerMessage::TaskError {
                        error: TaskError::from_error(&error),
                        execution_time,
                        memory_usage,
                    },
                );
            }
            None => {
                tracing::info!(
                    "🔨 Worker {} abandoned task {} after {:?}",
                    self.id,
                    task_id,
                    execution_time
                );
            }
        }

        keep_running
    }

    fn answer_health_check(&self, seq: u64) {
        self.send(
            None,
            WorkerMessage::HealthCheck {
                seq,
                memory_usage: self.memory.current(),
            },
        );
    }

    fn send(&self, task_id: Option<TaskId>, payload: WorkerMessage) {
        let _ = self.events.send(WorkerEvent::Message {
            worker_id: self.id,
            envelope: Envelope::new(task_id, payload),
        });
    }
}

/// Manager-side record of one worker
#[derive(Debug, Clone)]
pub(crate) struct WorkerInstance {
    pub(crate) id: WorkerId,
    pub(crate) status: WorkerStatus,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) tasks_completed: u64,
    pub(crate) total_execution_time: Duration,
    pub(crate) error_count: u64,
    pub(crate) current_memory: u64,
    pub(crate) peak_memory: u64,
    pub(crate) current_task: Option<TaskId>,
    pub(crate) last_error: Option<String>,
}

impl WorkerInstance {
    pub(crate) fn new(id: WorkerId, now: Instant) -> Self {
        Self {
            id,
            status: WorkerStatus::Starting,
            created_at: now,
            last_used: now,
            tasks_completed: 0,
            total_execution_time: Duration::ZERO,
            error_count: 0,
            current_memory: 0,
            peak_memory: 0,
            current_task: None,
            last_error: None,
        }
    }

    pub(crate) fn record_memory(&mut self, bytes: u64) {
        self.current_memory = bytes;
        self.peak_memory = self.peak_memory.max(bytes);
    }

    /// Put the worker back to idle after its task ended.
    pub(crate) fn release(&mut self, now: Instant) {
        self.status = WorkerStatus::Idle;
        self.current_task = None;
        self.last_used = now;
    }

    pub(crate) fn avg_task_time(&self) -> Option<Duration> {
        let finished = self.tasks_completed + self.error_count;
        (finished > 0).then(|| self.total_execution_time / finished.min(u32::MAX as u64) as u32)
    }

    pub(crate) fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            status: self.status,
            uptime: now.saturating_duration_since(self.created_at),
            tasks_completed: self.tasks_completed,
            error_count: self.error_count,
            avg_task_time: self.avg_task_time(),
            current_memory: self.current_memory,
            peak_memory: self.peak_memory,
            current_task: self.current_task.clone(),
            last_error: self.last_error.clone(),
            idle_for: (self.status == WorkerStatus::Idle)
                .then(|| now.saturating_duration_since(self.last_used)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::HandlerRegistry;
    use crate::error::PoolError;
    use serde_json::json;
    use tokio::time::timeout;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("double", |payload, ctx| async move {
                ctx.report_progress(50.0);
                let n = payload.as_i64().unwrap_or_default();
                Ok::<_, PoolError>(json!(n * 2))
            })
            .unwrap();
        registry
            .register_fn("fail", |_payload, _ctx| async move {
                Err::<Value, _>(PoolError::task_execution(
                    "bad input",
                    Some(Box::new(std::io::Error::other("parse error at 3"))),
                ))
            })
            .unwrap();
        registry
            .register_fn("sleep", |_payload, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, PoolError>(Value::Null)
            })
            .unwrap();
        registry
            .register_fn("hog", |_payload, ctx| async move {
                ctx.report_memory(850);
                ctx.report_memory(900);
                ctx.report_memory(1_500);
                Ok::<_, PoolError>(Value::Null)
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
    }

    struct Harness {
        handle: WorkerHandle,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        registry: HandlerRegistry,
    }

    impl Harness {
        fn start(limits: WorkerLimits) -> Self {
            let registry = registry();
            let (tx, events) = mpsc::unbounded_channel();
            let handle = spawn_worker(7, registry.handler_table(), limits, tx).unwrap();
            Self {
                handle,
                events,
                registry,
            }
        }

        fn assign(&self, id: &str, task_type: &str, data: Value) {
            let task = Task::builder()
                .with_id(id)
                .with_type(task_type)
                .with_data(data)
                .build()
                .unwrap();
            let handler = self.registry.resolve(task_type).unwrap();
            self.handle
                .inbox
                .send(Envelope::new(
                    Some(id.to_string()),
                    ManagerMessage::TaskAssignment { task, handler },
                ))
                .unwrap();
        }

        fn send(&self, message: ManagerMessage) {
            self.handle.inbox.send(Envelope::new(None, message)).unwrap();
        }

        async fn next(&mut self) -> WorkerEvent {
            timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("worker event")
                .expect("event channel open")
        }

        async fn next_message(&mut self) -> (Option<TaskId>, WorkerMessage) {
            match self.next().await {
                WorkerEvent::Message { worker_id, envelope } => {
                    assert_eq!(worker_id, 7);
                    (envelope.task_id, envelope.payload)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_ready_then_result() {
        let mut harness = Harness::start(WorkerLimits::default());
        assert!(matches!(
            harness.next_message().await,
            (None, WorkerMessage::WorkerReady)
        ));

        harness.assign("t1", "double", json!(21));
        let (task_id, progress) = harness.next_message().await;
        assert_eq!(task_id.as_deref(), Some("t1"));
        assert!(matches!(progress, WorkerMessage::TaskProgress { progress } if progress == 50.0));

        match harness.next_message().await {
            (Some(id), WorkerMessage::TaskResult { result, memory_usage, .. }) => {
                assert_eq!(id, "t1");
                assert_eq!(result, json!(42));
                assert_eq!(memory_usage, 2);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_keeps_worker_alive() {
        let mut harness = Harness::start(WorkerLimits::default());
        harness.next_message().await;

        harness.assign("bad", "fail", Value::Null);
        match harness.next_message().await {
            (Some(id), WorkerMessage::TaskError { error, .. }) => {
                assert_eq!(id, "bad");
                assert_eq!(error.kind, TaskErrorKind::Execution);
                assert_eq!(error.stack.as_deref(), Some("parse error at 3"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        harness.send(ManagerMessage::HealthCheck { seq: 9 });
        assert!(matches!(
            harness.next_message().await,
            (None, WorkerMessage::HealthCheck { seq: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check_while_busy_and_shutdown_cancels() {
        let mut harness = Harness::start(WorkerLimits::default());
        harness.next_message().await;

        harness.assign("long", "sleep", Value::Null);
        harness.send(ManagerMessage::HealthCheck { seq: 1 });
        assert!(matches!(
            harness.next_message().await,
            (None, WorkerMessage::HealthCheck { seq: 1, .. })
        ));

        harness.send(ManagerMessage::WorkerShutdown);
        assert!(matches!(
            harness.next().await,
            WorkerEvent::Exited {
                worker_id: 7,
                cause: WorkerExitCause::Normal
            }
        ));
        harness.handle.thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_memory_warnings() {
        let limits = WorkerLimits {
            memory_limit: Some(1_000),
            memory_warning_ratio: 0.8,
        };
        let mut harness = Harness::start(limits);
        harness.next_message().await;

        harness.assign("hog", "hog", Value::Null);
        assert!(matches!(
            harness.next_message().await,
            (_, WorkerMessage::MemoryWarning { usage: 850, limit: 1_000 })
        ));
        assert!(matches!(
            harness.next_message().await,
            (_, WorkerMessage::MemoryWarning { usage: 1_500, limit: 1_000 })
        ));
        assert!(matches!(
            harness.next_message().await,
            (_, WorkerMessage::TaskResult { memory_usage: 1_500, .. })
        ));
    }

    #[tokio::test]
    async fn test_panic_reports_exit() {
        let mut harness = Harness::start(WorkerLimits::default());
        harness.next_message().await;

        harness.assign("boom", "crash", Value::Null);
        match harness.next().await {
            WorkerEvent::Exited { worker_id, cause } => {
                assert_eq!(worker_id, 7);
                assert_eq!(
                    cause,
                    WorkerExitCause::Panic("simulated worker crash".to_string())
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_memory_tracker_levels() {
        let tracker = MemoryTracker::new(WorkerLimits {
            memory_limit: Some(100),
            memory_warning_ratio: 0.5,
        });
        assert_eq!(tracker.record(10), None);
        assert_eq!(tracker.record(60), Some(100));
        assert_eq!(tracker.record(70), None);
        assert_eq!(tracker.record(101), Some(100));
        assert_eq!(tracker.record(5), None);
        assert_eq!(tracker.peak(), 101);
        assert_eq!(tracker.current(), 5);

        tracker.reset();
        assert_eq!(tracker.record(60), Some(100));
    }

    #[test]
    fn test_worker_instance_info() {
        let now = Instant::now();
        let mut instance = WorkerInstance::new(3, now);
        instance.status = WorkerStatus::Busy;
        instance.current_task = Some("t".into());
        instance.tasks_completed = 3;
        instance.error_count = 1;
        instance.total_execution_time = Duration::from_millis(400);
        instance.record_memory(2_048);
        instance.record_memory(1_024);
        instance.release(now);

        let info = instance.info(now + Duration::from_secs(2));
        assert_eq!(info.status, WorkerStatus::Idle);
        assert_eq!(info.current_task, None);
        assert_eq!(info.avg_task_time, Some(Duration::from_millis(100)));
        assert_eq!(info.current_memory, 1_024);
        assert_eq!(info.peak_memory, 2_048);
        assert_eq!(info.uptime, Duration::from_secs(2));
        assert_eq!(info.idle_for, Some(Duration::from_secs(2)));
    }
}
