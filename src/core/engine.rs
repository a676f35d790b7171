//! The pool control loop.
//!
//! [`PoolEngine`] owns the queue, the worker table and every in-flight
//! execution record. It runs as a single tokio task and is the only code that
//! mutates any of them; the public [`WorkerPool`](super::WorkerPool) talks to
//! it through [`PoolCommand`]s, workers talk to it through
//! [`WorkerEvent`]s. Everything that resolves a task goes through
//! `PoolEngine::resolve`, which removes the pending entry first, so a task is
//! reported at most once whichever path gets there first.

use crate::config::{DurationExt, PoolConfig};
use crate::core::balancer::{self, LoadBalancer, WorkerCandidate};
use crate::core::registry::{HandlerId, HandlerRegistry, TaskHandler};
use crate::core::worker::{
    WorkerEvent, WorkerExitCause, WorkerInstance, WorkerLimits, WorkerStatus, spawn_worker,
};
use crate::error::{PoolError, PoolResult};
use crate::metrics::{MetricsRecorder, PoolHealth, PoolMetrics, WorkerInfo};
use crate::protocol::{Envelope, ManagerMessage, WorkerId, WorkerMessage};
use crate::queue::{PriorityTaskQueue, QueueStats, RestoreReport, save_snapshot};
use crate::task::{Task, TaskError, TaskErrorKind, TaskId, TaskOutcome, TaskPriority, TaskStatus};
use crate::utils::{as_millis_u64, calculate_backoff, sleep_until_opt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

#[cfg(feature = "metrics")]
use crate::metrics::PrometheusExporter;

/// Base delay before respawning after repeated worker failures
const RESTART_BACKOFF_BASE_MS: u64 = 100;

/// Notifications published by the pool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    TaskQueued {
        task_id: TaskId,
        priority: TaskPriority,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskProgress {
        task_id: TaskId,
        worker_id: WorkerId,
        progress: f32,
    },
    /// Exactly one per accepted task
    TaskFinished(TaskOutcome),
    /// The task timed out while still queued
    TaskExpired {
        task_id: TaskId,
        waited: Duration,
    },
    WorkerSpawned {
        worker_id: WorkerId,
    },
    WorkerReady {
        worker_id: WorkerId,
    },
    WorkerRetired {
        worker_id: WorkerId,
        reason: String,
    },
    WorkerFailed {
        worker_id: WorkerId,
        reason: String,
    },
    Metrics(Box<PoolMetrics>),
}

/// What happened during shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Tasks that completed successfully after shutdown began
    pub completed_during_grace: u64,
    /// Queued or running tasks failed with kind `shutdown`
    pub failed_on_shutdown: usize,
    /// Workers stopped at the end
    pub workers_terminated: usize,
    /// Whether the final queue snapshot was written
    pub persisted: bool,
    /// Work drained within the grace period and every thread joined
    pub clean: bool,
}

/// Why a task is being cancelled
#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelReason {
    Requested,
    SubmissionTimeout(Duration),
}

impl CancelReason {
    fn task_error(self) -> TaskError {
        match self {
            CancelReason::Requested => {
                TaskError::new(TaskErrorKind::Cancelled, "Task was cancelled by the caller")
            }
            CancelReason::SubmissionTimeout(limit) => TaskError::new(
                TaskErrorKind::Timeout,
                format!("Task did not finish within its {}ms submission timeout", as_millis_u64(limit)),
            ),
        }
    }
}

/// Requests from the pool handle to the control loop
pub(crate) enum PoolCommand {
    Submit {
        task: Task,
        responder: oneshot::Sender<TaskOutcome>,
        reply: oneshot::Sender<PoolResult<()>>,
    },
    Cancel {
        task_id: TaskId,
        reason: CancelReason,
        reply: Option<oneshot::Sender<bool>>,
    },
    Scale {
        target: usize,
        reply: oneshot::Sender<PoolResult<usize>>,
    },
    Metrics {
        reply: oneshot::Sender<PoolMetrics>,
    },
    WorkerInfo {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    QueueStats {
        reply: oneshot::Sender<QueueStats>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownSummary>,
    },
}

#[derive(Debug)]
enum WorkerFailure {
    Crashed(String),
    Unresponsive(Duration),
    MemoryLimit { usage: u64, limit: u64 },
}

impl WorkerFailure {
    fn task_error(&self) -> TaskError {
        match self {
            WorkerFailure::MemoryLimit { .. } => {
                TaskError::new(TaskErrorKind::ResourceLimit, self.to_string())
            }
            _ => TaskError::new(TaskErrorKind::WorkerLost, self.to_string()),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::Crashed(cause) => write!(f, "worker crashed: {cause}"),
            WorkerFailure::Unresponsive(waited) => {
                write!(f, "worker unresponsive for {}ms", as_millis_u64(*waited))
            }
            WorkerFailure::MemoryLimit { usage, limit } => {
                write!(f, "worker memory {usage} bytes exceeded limit of {limit} bytes")
            }
        }
    }
}

struct PendingTask {
    handler: HandlerId,
    task_type: String,
    retry_attempts: u32,
    submitted_at: Instant,
    responder: Option<oneshot::Sender<TaskOutcome>>,
}

#[derive(Debug)]
struct ExecutionRecord {
    worker_id: WorkerId,
    started_at: Instant,
    deadline: Option<Instant>,
    cpu_deadline: Option<Instant>,
}

struct WorkerSlot {
    state: WorkerInstance,
    inbox: mpsc::UnboundedSender<Envelope<ManagerMessage>>,
    thread: Option<std::thread::JoinHandle<()>>,
    /// Outstanding health probe: sequence number and send time
    probe: Option<(u64, Instant)>,
    /// Retire once the current task ends
    recycle: bool,
}

impl WorkerSlot {
    fn send(&self, task_id: Option<TaskId>, message: ManagerMessage) -> bool {
        self.inbox.send(Envelope::new(task_id, message)).is_ok()
    }
}

/// How a task left the pool
struct Settlement {
    result: Result<Value, TaskError>,
    worker_id: Option<WorkerId>,
    started_at: Option<Instant>,
    execution_time: Option<Duration>,
    memory_usage: Option<u64>,
}

impl Settlement {
    fn failed(error: TaskError) -> Self {
        Self {
            result: Err(error),
            worker_id: None,
            started_at: None,
            execution_time: None,
            memory_usage: None,
        }
    }

    fn on_worker(mut self, record: &ExecutionRecord, now: Instant) -> Self {
        self.worker_id = Some(record.worker_id);
        self.started_at = Some(record.started_at);
        self.execution_time = Some(now.saturating_duration_since(record.started_at));
        self
    }
}

struct ShutdownState {
    deadline: Instant,
    replies: Vec<oneshot::Sender<ShutdownSummary>>,
    completed_before: u64,
}

/// Single-threaded supervisor of the queue and the workers.
pub(crate) struct PoolEngine {
    config: PoolConfig,
    registry: Arc<HandlerRegistry>,
    handlers: Arc<[Arc<dyn TaskHandler>]>,
    queue: PriorityTaskQueue,
    pending: HashMap<TaskId, PendingTask>,
    executions: HashMap<TaskId, ExecutionRecord>,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    retired: Vec<std::thread::JoinHandle<()>>,
    next_worker_id: WorkerId,
    next_probe: u64,
    balancer: Box<dyn LoadBalancer>,
    worker_events: mpsc::UnboundedSender<WorkerEvent>,
    events: broadcast::Sender<PoolEvent>,
    metrics: MetricsRecorder,
    #[cfg(feature = "metrics")]
    exporter: Option<PrometheusExporter>,
    consecutive_failures: u32,
    pending_respawns: usize,
    respawn_after: Option<Instant>,
    persisting: Option<tokio::task::JoinHandle<()>>,
    shutdown: Option<ShutdownState>,
    shutting_down: Arc<AtomicBool>,
    commands_closed: bool,
}

impl PoolEngine {
    /// Build an engine. Returns it with the receiving end of the worker
    /// event channel, which [`PoolEngine::run`] consumes.
    pub(crate) fn new(
        config: PoolConfig,
        registry: Arc<HandlerRegistry>,
        events: broadcast::Sender<PoolEvent>,
        shutting_down: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (worker_events, worker_events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            handlers: registry.handler_table(),
            registry,
            queue: PriorityTaskQueue::with_config(&config.queue),
            pending: HashMap::new(),
            executions: HashMap::new(),
            workers: BTreeMap::new(),
            retired: Vec::new(),
            next_worker_id: 0,
            next_probe: 0,
            balancer: balancer::for_strategy(config.workers.load_balancing),
            worker_events,
            events,
            metrics: MetricsRecorder::new(Instant::now()),
            #[cfg(feature = "metrics")]
            exporter: None,
            consecutive_failures: 0,
            pending_respawns: 0,
            respawn_after: None,
            persisting: None,
            shutdown: None,
            shutting_down,
            commands_closed: false,
            config,
        };
        (engine, worker_events_rx)
    }

    /// Mirror every metrics tick into `exporter`.
    #[cfg(feature = "metrics")]
    pub(crate) fn with_exporter(mut self, exporter: Option<PrometheusExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// Spawn the initial `min_workers`.
    pub(crate) fn spawn_initial_workers(&mut self) -> PoolResult<()> {
        tracing::info!(
            "🔨 Starting pool with {} workers (max {}, {} balancing)",
            self.config.workers.min_workers,
            self.config.workers.max_workers,
            self.balancer.name()
        );
        for _ in 0..self.config.workers.min_workers {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Re-admit snapshot records with the same checks as a live submission.
    pub(crate) fn restore(&mut self, records: Vec<PoolResult<Task>>) -> RestoreReport {
        let mut report = RestoreReport::default();
        for (position, record) in records.into_iter().enumerate() {
            match record.and_then(|task| self.admit(task, None)) {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    tracing::warn!("🔨 Rejected snapshot record {}: {}", position, e);
                    report.rejected.push((position, e.to_string()));
                }
            }
        }
        if report.restored > 0 {
            tracing::info!("🔨 Restored {} queued tasks from snapshot", report.restored);
        }
        report
    }

    /// Drive the pool until shutdown completes.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let engine = &self.config.engine;
        let start = Instant::now();
        let mut tick = interval_at(start + engine.tick_interval(), engine.tick_interval());
        let mut health =
            interval_at(start + engine.health_check_interval(), engine.health_check_interval());
        let mut report = interval_at(start + engine.metrics_interval(), engine.metrics_interval());
        let persist_every = self.config.queue.persistence_interval_secs.max(1).secs();
        let mut persist = interval_at(start + persist_every, persist_every);
        for timer in [&mut tick, &mut health, &mut report, &mut persist] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tracing::info!("🔨 Pool control loop started");
        self.dispatch();

        loop {
            let wake_at = self.next_deadline();
            tokio::select! {
                command = commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("🔨 Pool handle dropped, shutting down");
                        self.commands_closed = true;
                        self.begin_shutdown(None);
                    }
                },
                Some(event) = worker_events.recv() => self.handle_worker_event(event),
                _ = tick.tick() => self.on_tick(),
                _ = sleep_until_opt(wake_at) => self.on_tick(),
                _ = health.tick() => self.probe_workers(),
                _ = report.tick() => self.emit_metrics(),
                _ = persist.tick() => self.persist_snapshot(),
            }

            if self.shutdown_ready(Instant::now()) {
                break;
            }
        }

        self.finish_shutdown().await;
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit {
                task,
                responder,
                reply,
            } => {
                let accepted = if self.shutdown.is_some() {
                    Err(PoolError::ShuttingDown)
                } else {
                    self.admit(task, Some(responder))
                };
                let admitted = accepted.is_ok();
                let _ = reply.send(accepted);
                if admitted {
                    self.dispatch();
                }
            }
            PoolCommand::Cancel {
                task_id,
                reason,
                reply,
            } => {
                let cancelled = self.cancel(&task_id, reason);
                if let Some(reply) = reply {
                    let _ = reply.send(cancelled);
                }
            }
            PoolCommand::Scale { target, reply } => {
                let _ = reply.send(self.scale(target));
            }
            PoolCommand::Metrics { reply } => {
                let _ = reply.send(self.snapshot_metrics(Instant::now()));
            }
            PoolCommand::WorkerInfo { reply } => {
                let now = Instant::now();
                let _ = reply.send(self.workers.values().map(|slot| slot.state.info(now)).collect());
            }
            PoolCommand::QueueStats { reply } => {
                let _ = reply.send(self.queue.stats());
            }
            PoolCommand::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    /// Validate a task and put it in the queue.
    fn admit(
        &mut self,
        task: Task,
        responder: Option<oneshot::Sender<TaskOutcome>>,
    ) -> PoolResult<()> {
        task.validate()?;
        if self.pending.contains_key(&task.id) {
            return Err(PoolError::DuplicateTask { task_id: task.id });
        }
        let handler =
            self.registry
                .resolve(&task.task_type)
                .ok_or_else(|| PoolError::UnknownTaskType {
                    task_type: task.task_type.clone(),
                })?;

        let task_id = task.id.clone();
        let priority = task.priority;
        let pending = PendingTask {
            handler,
            task_type: task.task_type.clone(),
            retry_attempts: task.retry_attempts,
            submitted_at: Instant::now(),
            responder,
        };
        self.queue.enqueue(task)?;
        self.pending.insert(task_id.clone(), pending);

        tracing::debug!("🔨 Task queued: {} (priority {})", task_id, priority);
        self.publish(PoolEvent::TaskQueued { task_id, priority });
        Ok(())
    }

    /// Hand queued tasks to idle workers until one side runs out.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let candidates: Vec<WorkerCandidate> = self
                .workers
                .values()
                .filter(|slot| slot.state.status == WorkerStatus::Idle)
                .map(|slot| WorkerCandidate {
                    id: slot.state.id,
                    tasks_completed: slot.state.tasks_completed,
                })
                .collect();
            if candidates.is_empty() {
                break;
            }
            let Some(worker_id) = self.balancer.select(&candidates) else {
                break;
            };
            let Some(task) = self.queue.dequeue() else {
                break;
            };
            self.assign(worker_id, task);
        }
    }

    fn assign(&mut self, worker_id: WorkerId, task: Task) {
        let now = Instant::now();
        let task_id = task.id.clone();
        let Some(handler) = self.pending.get(&task_id).map(|pending| pending.handler) else {
            tracing::error!("🔨 Dequeued task {} has no pending entry", task_id);
            return;
        };
        let attempt_timeout = task.queue_timeout().or(self.config.workers.task_timeout());
        let cpu_limit = self.config.workers.cpu_time_limit();

        let Some(slot) = self.workers.get_mut(&worker_id) else {
            return;
        };
        slot.state.status = WorkerStatus::Busy;
        slot.state.current_task = Some(task_id.clone());
        slot.state.last_used = now;
        self.executions.insert(
            task_id.clone(),
            ExecutionRecord {
                worker_id,
                started_at: now,
                deadline: attempt_timeout.map(|timeout| now + timeout),
                cpu_deadline: cpu_limit.map(|limit| now + limit),
            },
        );

        let sent = slot.send(
            Some(task_id.clone()),
            ManagerMessage::TaskAssignment { task, handler },
        );
        if !sent {
            self.fail_worker(worker_id, WorkerFailure::Crashed("inbox closed".to_string()));
            return;
        }

        tracing::debug!("🔨 Task {} assigned to worker {}", task_id, worker_id);
        self.publish(PoolEvent::TaskStarted { task_id, worker_id });
    }

    /// Add at most one worker per tick while the backlog is deep.
    fn maybe_autoscale(&mut self) {
        let workers = &self.config.workers;
        if !workers.auto_scale || self.shutdown.is_some() {
            return;
        }
        if self.queue.len() >= workers.scaling_threshold && self.workers.len() < workers.max_workers
        {
            tracing::info!(
                "🔨 Auto-scaling: queue depth {} >= threshold {}, adding a worker",
                self.queue.len(),
                workers.scaling_threshold
            );
            let _ = self.spawn_worker();
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message {
                worker_id,
                envelope,
            } => self.handle_message(worker_id, envelope),
            WorkerEvent::Exited { worker_id, cause } => {
                if !self.workers.contains_key(&worker_id) {
                    tracing::debug!("🔨 Retired worker {} exited", worker_id);
                    return;
                }
                let reason = match cause {
                    WorkerExitCause::Normal => "exited unexpectedly".to_string(),
                    WorkerExitCause::Panic(message) => format!("panicked: {message}"),
                    WorkerExitCause::RuntimeError(message) => format!("runtime error: {message}"),
                };
                self.fail_worker(worker_id, WorkerFailure::Crashed(reason));
            }
        }
    }

    fn handle_message(&mut self, worker_id: WorkerId, envelope: Envelope<WorkerMessage>) {
        let now = Instant::now();
        let task_id = envelope.task_id;
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            slot.probe = None;
        }

        match envelope.payload {
            WorkerMessage::WorkerReady => {
                let Some(slot) = self.workers.get_mut(&worker_id) else {
                    return;
                };
                if slot.state.status == WorkerStatus::Starting {
                    slot.state.release(now);
                }
                tracing::debug!("🔨 Worker {} is ready", worker_id);
                self.publish(PoolEvent::WorkerReady { worker_id });
                self.dispatch();
            }
            WorkerMessage::TaskResult {
                result,
                execution_time,
                memory_usage,
            } => self.complete_task(worker_id, task_id, Ok(result), execution_time, memory_usage),
            WorkerMessage::TaskError {
                error,
                execution_time,
                memory_usage,
            } => self.complete_task(worker_id, task_id, Err(error), execution_time, memory_usage),
            WorkerMessage::TaskProgress { progress } => {
                let Some(task_id) = task_id else {
                    return;
                };
                let owned = self
                    .executions
                    .get(&task_id)
                    .is_some_and(|record| record.worker_id == worker_id);
                if owned {
                    self.publish(PoolEvent::TaskProgress {
                        task_id,
                        worker_id,
                        progress,
                    });
                }
            }
            WorkerMessage::HealthCheck { seq, memory_usage } => {
                tracing::trace!("🔨 Worker {} answered probe {}", worker_id, seq);
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.state.record_memory(memory_usage);
                }
                self.metrics.record_memory(memory_usage);
            }
            WorkerMessage::MemoryWarning { usage, limit } => {
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.state.record_memory(usage);
                }
                self.metrics.record_memory(usage);

                let current = self
                    .workers
                    .get(&worker_id)
                    .and_then(|slot| slot.state.current_task.clone());
                if usage > limit && (task_id.is_none() || task_id == current) {
                    self.fail_worker(worker_id, WorkerFailure::MemoryLimit { usage, limit });
                } else if usage > limit {
                    // an abandoned task leaked: replace the worker, spare its current task
                    tracing::warn!(
                        "🔨 Worker {} exceeded {} bytes on abandoned task {}, recycling it",
                        worker_id,
                        limit,
                        task_id.as_deref().unwrap_or("?")
                    );
                    match current {
                        Some(_) => {
                            if let Some(slot) = self.workers.get_mut(&worker_id) {
                                slot.recycle = true;
                            }
                        }
                        None => self.recycle_worker(worker_id, now),
                    }
                } else {
                    tracing::warn!(
                        "🔨 Worker {} memory at {} of {} bytes",
                        worker_id,
                        usage,
                        limit
                    );
                }
            }
        }
    }

    fn complete_task(
        &mut self,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        result: Result<Value, TaskError>,
        execution_time: Duration,
        memory_usage: u64,
    ) {
        let Some(task_id) = task_id else {
            tracing::warn!("🔨 Worker {} sent a result without a task id", worker_id);
            return;
        };
        let owned = self
            .executions
            .get(&task_id)
            .is_some_and(|record| record.worker_id == worker_id);
        if !owned {
            tracing::debug!(
                "🔨 Ignoring stale result for task {} from worker {}",
                task_id,
                worker_id
            );
            return;
        }
        let Some(record) = self.executions.remove(&task_id) else {
            return;
        };

        let now = Instant::now();
        if let Some(slot) = self.workers.get_mut(&worker_id) {
            match &result {
                Ok(_) => slot.state.tasks_completed += 1,
                Err(error) => {
                    slot.state.error_count += 1;
                    slot.state.last_error = Some(error.to_string());
                }
            }
            slot.state.total_execution_time += execution_time;
            slot.state.record_memory(memory_usage);
            if slot.state.current_task.as_deref() == Some(task_id.as_str()) {
                slot.state.release(now);
            }
        }
        let recycle = self.workers.get(&worker_id).is_some_and(|slot| slot.recycle);
        if result.is_ok() {
            self.consecutive_failures = 0;
        }

        self.resolve(
            task_id,
            Settlement {
                result,
                worker_id: Some(worker_id),
                started_at: Some(record.started_at),
                execution_time: Some(execution_time),
                memory_usage: Some(memory_usage),
            },
        );
        if recycle {
            self.recycle_worker(worker_id, now);
        }
        self.dispatch();
    }

    /// Deliver the single terminal outcome of a task.
    fn resolve(&mut self, task_id: TaskId, settlement: Settlement) {
        let Some(pending) = self.pending.remove(&task_id) else {
            return;
        };
        let now = Instant::now();
        let wait_time = settlement
            .started_at
            .unwrap_or(now)
            .saturating_duration_since(pending.submitted_at);

        let (success, status, result, error) = match settlement.result {
            Ok(value) => (true, TaskStatus::Completed, Some(value), None),
            Err(error) => (false, error.status(), None, Some(error)),
        };
        let outcome = TaskOutcome {
            task_id,
            task_type: pending.task_type,
            success,
            status,
            result,
            error,
            worker_id: settlement.worker_id,
            execution_time: settlement.execution_time,
            wait_time,
            memory_usage: settlement.memory_usage,
            retry_attempts: pending.retry_attempts,
        };

        match &outcome.error {
            None => tracing::debug!(
                "🔨 Task {} completed in {:?}",
                outcome.task_id,
                outcome.execution_time.unwrap_or_default()
            ),
            Some(error) => tracing::warn!("🔨 Task {} failed: {}", outcome.task_id, error),
        }

        self.metrics.record_outcome(&outcome);
        self.publish(PoolEvent::TaskFinished(outcome.clone()));
        if let Some(responder) = pending.responder {
            let _ = responder.send(outcome);
        }
    }

    fn cancel(&mut self, task_id: &str, reason: CancelReason) -> bool {
        if let Some(task) = self.queue.remove_task(task_id) {
            tracing::info!("🔨 Removed queued task {}", task_id);
            self.resolve(task.id, Settlement::failed(reason.task_error()));
            return true;
        }
        if self.executions.contains_key(task_id) {
            let restart = self.config.workers.restart_on_timeout;
            self.abort_execution(task_id, reason.task_error(), restart);
            self.dispatch();
            return true;
        }
        false
    }

    /// Fail a running task from the manager's side.
    ///
    /// The worker is either retired and replaced, or released and left to
    /// finish the abandoned task; its late result is then ignored.
    fn abort_execution(&mut self, task_id: &str, error: TaskError, restart: bool) {
        let Some(record) = self.executions.remove(task_id) else {
            return;
        };
        let now = Instant::now();
        let worker_id = record.worker_id;
        let reason = error.message.clone();
        self.resolve(
            task_id.to_string(),
            Settlement::failed(error).on_worker(&record, now),
        );

        if restart {
            if self.retire_worker(worker_id, &reason) && self.shutdown.is_none() {
                self.pending_respawns += 1;
                self.replenish(now);
            }
        } else if let Some(slot) = self.workers.get_mut(&worker_id) {
            slot.state.error_count += 1;
            slot.state.last_error = Some(reason);
            slot.state.release(now);
            if slot.recycle {
                self.recycle_worker(worker_id, now);
            }
        }
    }

    /// Retire a healthy but tainted worker and schedule its replacement.
    fn recycle_worker(&mut self, worker_id: WorkerId, now: Instant) {
        if self.retire_worker(worker_id, "memory limit exceeded by an abandoned task")
            && self.shutdown.is_none()
        {
            self.pending_respawns += 1;
            self.replenish(now);
        }
    }

    /// Remove a broken worker, fail its task and schedule a replacement.
    fn fail_worker(&mut self, worker_id: WorkerId, failure: WorkerFailure) {
        let Some(mut slot) = self.workers.remove(&worker_id) else {
            return;
        };
        let now = Instant::now();
        slot.state.status = WorkerStatus::Error;
        tracing::error!("🔨 Worker {} failed: {}", worker_id, failure);
        self.metrics.record_worker_failure();
        self.consecutive_failures += 1;

        if let Some(task_id) = slot.state.current_task.take() {
            let owned = self
                .executions
                .get(&task_id)
                .is_some_and(|record| record.worker_id == worker_id);
            let record = if owned {
                self.executions.remove(&task_id)
            } else {
                None
            };
            if let Some(record) = record {
                self.resolve(
                    task_id,
                    Settlement::failed(failure.task_error()).on_worker(&record, now),
                );
            }
        }

        slot.send(None, ManagerMessage::WorkerShutdown);
        if let Some(thread) = slot.thread.take() {
            self.retired.push(thread);
        }
        self.publish(PoolEvent::WorkerFailed {
            worker_id,
            reason: failure.to_string(),
        });

        if self.shutdown.is_none() {
            if self.config.workers.restart_on_error {
                self.pending_respawns += 1;
            }
            if self.consecutive_failures > 1 {
                let backoff = calculate_backoff(self.consecutive_failures - 1, RESTART_BACKOFF_BASE_MS);
                tracing::info!("🔨 Backing off {}ms before restarting workers", backoff);
                self.respawn_after = Some(now + backoff.millis());
            }
            self.replenish(now);
        }
        self.dispatch();
    }

    /// Stop a worker on purpose. Returns whether it existed.
    fn retire_worker(&mut self, worker_id: WorkerId, reason: &str) -> bool {
        let Some(mut slot) = self.workers.remove(&worker_id) else {
            return false;
        };
        slot.state.status = WorkerStatus::Terminated;
        slot.send(None, ManagerMessage::WorkerShutdown);
        if let Some(thread) = slot.thread.take() {
            self.retired.push(thread);
        }

        tracing::info!("🔨 Retired worker {} ({})", worker_id, reason);
        self.publish(PoolEvent::WorkerRetired {
            worker_id,
            reason: reason.to_string(),
        });
        true
    }

    fn spawn_worker(&mut self) -> PoolResult<WorkerId> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let limits = WorkerLimits {
            memory_limit: self.config.workers.memory_limit_bytes,
            memory_warning_ratio: self.config.workers.memory_warning_ratio,
        };
        let handle = spawn_worker(
            id,
            Arc::clone(&self.handlers),
            limits,
            self.worker_events.clone(),
        )
        .inspect_err(|e| tracing::error!("🔨 Failed to spawn worker {}: {}", id, e))?;

        self.workers.insert(
            id,
            WorkerSlot {
                state: WorkerInstance::new(id, Instant::now()),
                inbox: handle.inbox,
                thread: Some(handle.thread),
                probe: None,
                recycle: false,
            },
        );
        self.metrics.record_spawn();

        tracing::info!("🔨 Spawned worker {} ({} in pool)", id, self.workers.len());
        self.publish(PoolEvent::WorkerSpawned { worker_id: id });
        Ok(id)
    }

    /// Spawn scheduled replacements and top the pool up to `min_workers`.
    fn replenish(&mut self, now: Instant) {
        if self.respawn_after.is_some_and(|at| at > now) {
            return;
        }
        self.respawn_after = None;
        if self.shutdown.is_some() {
            return;
        }

        let (min, max) = (self.config.workers.min_workers, self.config.workers.max_workers);
        while self.pending_respawns > 0 && self.workers.len() < max {
            self.pending_respawns -= 1;
            if self.spawn_worker().is_err() {
                return;
            }
        }
        self.pending_respawns = 0;

        while self.workers.len() < min {
            if self.spawn_worker().is_err() {
                return;
            }
        }
    }

    fn scale(&mut self, target: usize) -> PoolResult<usize> {
        if self.shutdown.is_some() {
            return Err(PoolError::ShuttingDown);
        }
        let (min, max) = (self.config.workers.min_workers, self.config.workers.max_workers);
        if target < min || target > max {
            return Err(PoolError::ScaleOutOfRange { target, min, max });
        }

        let current = self.workers.len();
        if target > current {
            for _ in current..target {
                self.spawn_worker()?;
            }
        } else if target < current {
            let idle: Vec<WorkerId> = self
                .workers
                .values()
                .rev()
                .filter(|slot| slot.state.status == WorkerStatus::Idle)
                .map(|slot| slot.state.id)
                .take(current - target)
                .collect();
            for worker_id in idle {
                self.retire_worker(worker_id, "scaled down");
            }
            if self.workers.len() > target {
                tracing::warn!(
                    "🔨 Partial scale-down: {} workers remain (target {}), busy workers are kept",
                    self.workers.len(),
                    target
                );
            }
        }

        tracing::info!("🔨 Pool scaled to {} workers", self.workers.len());
        self.dispatch();
        Ok(self.workers.len())
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.expire_queued(now);
        self.enforce_execution_limits(now);
        self.check_health(now);
        self.evict_idle(now);
        self.reap_retired();
        self.replenish(now);
        self.maybe_autoscale();
        self.dispatch();
    }

    fn expire_queued(&mut self, now: Instant) {
        for expired in self.queue.expire_due(now) {
            let task_id = expired.task.id;
            tracing::warn!(
                "🔨 Task {} expired after {:?} in queue",
                task_id,
                expired.waited
            );
            self.publish(PoolEvent::TaskExpired {
                task_id: task_id.clone(),
                waited: expired.waited,
            });
            self.resolve(
                task_id,
                Settlement::failed(TaskError::new(
                    TaskErrorKind::Timeout,
                    format!(
                        "Task timed out after waiting {}ms in queue",
                        as_millis_u64(expired.waited)
                    ),
                )),
            );
        }
    }

    fn enforce_execution_limits(&mut self, now: Instant) {
        let overdue: Vec<(TaskId, TaskError)> = self
            .executions
            .iter()
            .filter_map(|(task_id, record)| {
                let ran = as_millis_u64(now.saturating_duration_since(record.started_at));
                if record.deadline.is_some_and(|deadline| deadline <= now) {
                    Some((
                        task_id.clone(),
                        TaskError::new(
                            TaskErrorKind::Timeout,
                            format!("Task exceeded its execution timeout after {ran}ms"),
                        ),
                    ))
                } else if record.cpu_deadline.is_some_and(|deadline| deadline <= now) {
                    Some((
                        task_id.clone(),
                        TaskError::new(
                            TaskErrorKind::ResourceLimit,
                            format!("Task exceeded the cpu time limit after {ran}ms"),
                        ),
                    ))
                } else {
                    None
                }
            })
            .collect();

        for (task_id, error) in overdue {
            let restart = match error.kind {
                TaskErrorKind::ResourceLimit => true,
                _ => self.config.workers.restart_on_timeout,
            };
            self.abort_execution(&task_id, error, restart);
        }
    }

    fn check_health(&mut self, now: Instant) {
        let limit = self.config.engine.health_check_timeout();
        let unresponsive: Vec<(WorkerId, Duration)> = self
            .workers
            .values()
            .filter_map(|slot| {
                let silent_since = match slot.state.status {
                    WorkerStatus::Starting => Some(slot.state.created_at),
                    // a blocking handler cannot answer; its execution limits bound it instead
                    WorkerStatus::Busy if self.runs_own_task(slot) => None,
                    _ => slot.probe.map(|(_, sent_at)| sent_at),
                }?;
                let waited = now.saturating_duration_since(silent_since);
                (waited > limit).then_some((slot.state.id, waited))
            })
            .collect();

        for (worker_id, waited) in unresponsive {
            self.fail_worker(worker_id, WorkerFailure::Unresponsive(waited));
        }
    }

    fn runs_own_task(&self, slot: &WorkerSlot) -> bool {
        slot.state.current_task.as_ref().is_some_and(|task_id| {
            self.executions
                .get(task_id)
                .is_some_and(|record| record.worker_id == slot.state.id)
        })
    }

    fn probe_workers(&mut self) {
        let now = Instant::now();
        for slot in self.workers.values_mut() {
            if slot.state.status == WorkerStatus::Starting || slot.probe.is_some() {
                continue;
            }
            self.next_probe += 1;
            if slot.send(None, ManagerMessage::HealthCheck { seq: self.next_probe }) {
                slot.probe = Some((self.next_probe, now));
            }
        }
    }

    fn evict_idle(&mut self, now: Instant) {
        let Some(idle_timeout) = self.config.workers.idle_timeout() else {
            return;
        };
        if self.shutdown.is_some() {
            return;
        }
        let surplus = self.workers.len().saturating_sub(self.config.workers.min_workers);
        if surplus == 0 {
            return;
        }

        let stale: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|slot| {
                slot.state.status == WorkerStatus::Idle
                    && now.saturating_duration_since(slot.state.last_used) >= idle_timeout
            })
            .map(|slot| slot.state.id)
            .take(surplus)
            .collect();
        for worker_id in stale {
            self.retire_worker(worker_id, "idle timeout");
        }
    }

    fn reap_retired(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|thread| thread.is_finished());
        self.retired = running;
        for thread in finished {
            let _ = thread.join();
        }
    }

    fn snapshot_metrics(&self, now: Instant) -> PoolMetrics {
        self.metrics.snapshot(
            self.workers.values().map(|slot| &slot.state),
            self.queue.len(),
            self.executions.len(),
            now,
        )
    }

    fn emit_metrics(&mut self) {
        let metrics = self.snapshot_metrics(Instant::now());
        let health = metrics.health(self.config.workers.min_workers);

        tracing::info!(
            "🔨 POOL HEALTH - Status: {} | Workers: {} (busy {}, idle {}, starting {}) | Queue: {} | Running: {} | Done: {} | Failed: {} | Uptime: {:?}",
            health,
            metrics.pool_size,
            metrics.busy_workers,
            metrics.idle_workers,
            metrics.starting_workers,
            metrics.queued_tasks,
            metrics.running_tasks,
            metrics.completed,
            metrics.failed + metrics.timed_out,
            metrics.uptime
        );
        if health == PoolHealth::Critical {
            tracing::error!("🔨 CRITICAL: no worker is available");
        }

        #[cfg(feature = "metrics")]
        if let Some(exporter) = &self.exporter {
            exporter.observe(&metrics);
        }

        self.publish(PoolEvent::Metrics(Box::new(metrics)));
    }

    fn persist_snapshot(&mut self) {
        let Some(path) = self.config.queue.snapshot_path().map(PathBuf::from) else {
            return;
        };
        if self.persisting.as_ref().is_some_and(|write| !write.is_finished()) {
            tracing::debug!("🔨 Previous snapshot still being written, skipping");
            return;
        }

        let tasks = self.queue.snapshot();
        self.persisting = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = save_snapshot(&path, &tasks) {
                tracing::error!("🔨 Failed to persist queue snapshot: {}", e);
            }
        }));
    }

    fn publish(&self, event: PoolEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let executions = self
            .executions
            .values()
            .flat_map(|record| [record.deadline, record.cpu_deadline])
            .flatten();
        let shutdown = self.shutdown.as_ref().map(|state| state.deadline);

        executions
            .chain(self.queue.next_deadline())
            .chain(shutdown)
            .chain(self.respawn_after)
            .min()
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<ShutdownSummary>>) {
        if let Some(state) = &mut self.shutdown {
            state.replies.extend(reply);
            return;
        }

        self.shutting_down.store(true, Ordering::Release);
        tracing::info!(
            "🔨 Shutting down pool: {} queued, {} running",
            self.queue.len(),
            self.executions.len()
        );
        self.shutdown = Some(ShutdownState {
            deadline: Instant::now() + self.config.engine.shutdown_grace(),
            replies: reply.into_iter().collect(),
            completed_before: self.metrics.completed(),
        });
        self.dispatch();
    }

    fn shutdown_ready(&self, now: Instant) -> bool {
        self.shutdown.as_ref().is_some_and(|state| {
            (self.queue.is_empty() && self.executions.is_empty()) || now >= state.deadline
        })
    }

    async fn finish_shutdown(mut self) {
        let drained = self.queue.is_empty() && self.executions.is_empty();
        let now = Instant::now();

        if let Some(write) = self.persisting.take() {
            let _ = write.await;
        }
        let persisted = match self.config.queue.snapshot_path().map(PathBuf::from) {
            Some(path) => {
                let tasks = self.queue.snapshot();
                match tokio::task::spawn_blocking(move || save_snapshot(&path, &tasks)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::error!("🔨 Failed to write final queue snapshot: {}", e);
                        false
                    }
                    Err(e) => {
                        tracing::error!("🔨 Final queue snapshot task failed: {}", e);
                        false
                    }
                }
            }
            None => false,
        };

        let mut failed_on_shutdown = 0;
        for task in self.queue.drain() {
            self.resolve(
                task.id,
                Settlement::failed(TaskError::new(
                    TaskErrorKind::Shutdown,
                    "Pool shut down before the task was dispatched",
                )),
            );
            failed_on_shutdown += 1;
        }
        let running: Vec<TaskId> = self.executions.keys().cloned().collect();
        for task_id in running {
            if let Some(record) = self.executions.remove(&task_id) {
                self.resolve(
                    task_id,
                    Settlement::failed(TaskError::new(
                        TaskErrorKind::Shutdown,
                        "Pool shut down while the task was running",
                    ))
                    .on_worker(&record, now),
                );
                failed_on_shutdown += 1;
            }
        }

        let workers_terminated = self.workers.len();
        let mut threads = std::mem::take(&mut self.retired);
        for (_, mut slot) in std::mem::take(&mut self.workers) {
            slot.state.status = WorkerStatus::Terminated;
            slot.send(None, ManagerMessage::WorkerShutdown);
            threads.extend(slot.thread.take());
        }

        let join_deadline = Instant::now() + self.config.workers.shutdown_timeout_ms.millis();
        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                threads.into_iter().partition(|thread| thread.is_finished());
            for thread in finished {
                let _ = thread.join();
            }
            threads = running;
            if threads.is_empty() || Instant::now() >= join_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !threads.is_empty() {
            tracing::warn!("🔨 {} worker threads did not stop in time", threads.len());
        }

        let Some(state) = self.shutdown.take() else {
            return;
        };
        let summary = ShutdownSummary {
            completed_during_grace: self.metrics.completed() - state.completed_before,
            failed_on_shutdown,
            workers_terminated,
            persisted,
            clean: drained && threads.is_empty(),
        };
        tracing::info!(
            "🔨 Pool shutdown complete: {} completed during grace, {} failed, {} workers stopped",
            summary.completed_during_grace,
            summary.failed_on_shutdown,
            summary.workers_terminated
        );
        for reply in state.replies {
            let _ = reply.send(summary.clone());
        }
    }
}
