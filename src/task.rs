//! Task definition, builder and outcome types.

use crate::core::worker::TaskContext;
use crate::error::{PoolError, PoolResult};
use crate::protocol::WorkerId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Unique identifier for a task
pub type TaskId = String;

/// Task priority levels.
///
/// Ordered `Critical > High > Normal > Low`. Serialized as the integer rank so
/// that queue snapshots stay compact; decoding an unknown rank fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskPriority {
    /// Background work
    Low = 0,
    /// Default priority
    #[default]
    Normal = 1,
    /// Ahead of normal work
    High = 2,
    /// Always dispatched first
    Critical = 3,
}

impl TaskPriority {
    /// Every priority, highest first. This is the dequeue scan order.
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Bucket index of this priority (0 for `Low`).
    pub fn rank(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = PoolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskPriority::Low),
            1 => Ok(TaskPriority::Normal),
            2 => Ok(TaskPriority::High),
            3 => Ok(TaskPriority::Critical),
            other => Err(PoolError::validation(format!(
                "invalid priority {other} (expected 0..=3)"
            ))),
        }
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        priority as u8
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Normal => "NORMAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Status of a task through its lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Built but not yet accepted by a pool
    Pending,
    /// Waiting in the priority queue
    Queued,
    /// Assigned to a worker
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error or lost with its worker
    Failed,
    /// Removed before completion
    Cancelled,
    /// Expired in the queue or while running
    Timeout,
}

impl TaskStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

/// A unit of work.
///
/// The payload is opaque to the pool; only the handler registered for
/// `task_type` interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Type tag used to pick the handler
    pub task_type: String,
    /// Serialized task payload
    pub data: Value,
    /// Dispatch priority
    #[serde(default)]
    pub priority: TaskPriority,
    /// Deadline for the task, measured from enqueue and again from dispatch
    #[serde(default, rename = "timeout_ms", with = "timeout_millis")]
    pub timeout: Option<Duration>,
    /// Retry budget, advisory for the caller
    #[serde(default)]
    pub retry_attempts: u32,
    /// Caller bookkeeping
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// When the task was built
    pub created_at: SystemTime,
}

impl Task {
    /// Start building a task.
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// Create a normal-priority task with a generated id.
    pub fn new(task_type: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            data: data.into(),
            priority: TaskPriority::Normal,
            timeout: None,
            retry_attempts: 0,
            metadata: HashMap::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Check the fields that cannot be expressed through the type system.
    pub fn validate(&self) -> PoolResult<()> {
        if self.id.trim().is_empty() {
            return Err(PoolError::validation("task id must not be empty"));
        }
        if self.task_type.trim().is_empty() {
            return Err(PoolError::validation("task type must not be empty"));
        }
        Ok(())
    }

    /// The queue-side timer, if one should be armed.
    pub(crate) fn queue_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|timeout| !timeout.is_zero())
    }
}

mod timeout_millis {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(timeout) => serializer.serialize_some(&(timeout.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<i64>::deserialize(deserializer)? {
            Some(ms) if ms < 0 => Err(D::Error::custom(format!(
                "timeout must not be negative (got {ms} ms)"
            ))),
            Some(ms) => Ok(Some(Duration::from_millis(ms as u64))),
            None => Ok(None),
        }
    }
}

/// Builder for [`Task`].
///
/// `task_type` and `data` are required; the id defaults to a fresh UUID and
/// the priority to `Normal`.
#[derive(Debug, Default)]
pub struct TaskBuilder {
    id: Option<TaskId>,
    task_type: Option<String>,
    data: Option<Value>,
    priority: Option<TaskPriority>,
    timeout: Option<Duration>,
    retry_attempts: u32,
    metadata: HashMap<String, Value>,
}

impl TaskBuilder {
    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the type tag.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Set the payload.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Serialize a value into the payload.
    pub fn with_json<T: Serialize>(mut self, data: &T) -> PoolResult<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the timeout. A zero duration means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the advisory retry budget.
    pub fn with_retries(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Finish the task.
    pub fn build(self) -> PoolResult<Task> {
        let task_type = self
            .task_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PoolError::validation("task type is required"))?;
        let data = self
            .data
            .ok_or_else(|| PoolError::validation("task data is required"))?;

        let task = Task {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            task_type,
            data,
            priority: self.priority.unwrap_or_default(),
            timeout: self.timeout,
            retry_attempts: self.retry_attempts,
            metadata: self.metadata,
            created_at: SystemTime::now(),
        };
        task.validate()?;
        Ok(task)
    }
}

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskErrorKind {
    /// The handler returned an error
    Execution,
    /// Queue-side or execution-side deadline elapsed
    Timeout,
    /// The worker crashed or stopped answering health checks
    WorkerLost,
    /// Memory or CPU-time limit exceeded
    ResourceLimit,
    /// Removed on request
    Cancelled,
    /// The pool shut down before the task finished
    Shutdown,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskErrorKind::Execution => "execution",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::WorkerLost => "worker-lost",
            TaskErrorKind::ResourceLimit => "resource-limit",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Structured failure reported for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure class
    pub kind: TaskErrorKind,
    /// Human-readable message
    pub message: String,
    /// Error source chain, when the handler provided one
    pub stack: Option<String>,
}

impl TaskError {
    /// Create an error without stack context
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    /// Capture a handler error together with its source chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: TaskErrorKind::Execution,
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }

    /// Terminal status this error maps to.
    pub fn status(&self) -> TaskStatus {
        match self.kind {
            TaskErrorKind::Timeout => TaskStatus::Timeout,
            TaskErrorKind::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

/// The terminal notification delivered once per submitted task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task identifier
    pub task_id: TaskId,
    /// Type tag of the task
    pub task_type: String,
    /// `true` only for `Completed`
    pub success: bool,
    /// Terminal status
    pub status: TaskStatus,
    /// Handler output on success
    pub result: Option<Value>,
    /// Failure details otherwise
    pub error: Option<TaskError>,
    /// Worker that ran the task, if it was dispatched
    pub worker_id: Option<WorkerId>,
    /// Time spent running, if it was dispatched
    pub execution_time: Option<Duration>,
    /// Time between submission and dispatch (or resolution, if never dispatched)
    pub wait_time: Duration,
    /// Peak memory reported by the worker for this attempt
    pub memory_usage: Option<u64>,
    /// Advisory retry budget copied from the task
    pub retry_attempts: u32,
}

impl TaskOutcome {
    /// Turn the outcome into the handler output or a [`PoolError::TaskFailed`].
    pub fn into_result(self) -> PoolResult<Value> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let error = self
            .error
            .unwrap_or_else(|| TaskError::new(TaskErrorKind::Execution, "unknown failure"));
        Err(PoolError::TaskFailed {
            task_id: self.task_id,
            error,
        })
    }

    /// Decode the handler output.
    pub fn output<T: DeserializeOwned>(&self) -> PoolResult<T> {
        match (&self.result, &self.error) {
            (Some(value), _) if self.success => Ok(serde_json::from_value(value.clone())?),
            (_, Some(error)) => Err(PoolError::TaskFailed {
                task_id: self.task_id.clone(),
                error: error.clone(),
            }),
            _ => Err(PoolError::validation(format!(
                "task {} produced no output",
                self.task_id
            ))),
        }
    }
}

/// Trait for strongly typed calculation tasks.
///
/// The value itself is the payload; [`crate::core::registry::HandlerRegistry::register_typed`]
/// wires it to a handler that decodes the payload and calls `forge`.
#[async_trait]
pub trait CalculationTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The output type returned by this task
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Run the calculation.
    async fn forge(self, ctx: TaskContext) -> PoolResult<Self::Output>;

    /// Type tag used for registration and dispatch.
    fn task_type() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }

    /// Priority used by the facade when submitting.
    fn priority(&self) -> TaskPriority {
        TaskPriority::Normal
    }

    /// Per-attempt timeout used by the facade when submitting.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Retry budget used by the facade.
    fn max_retries(&self) -> u32 {
        0
    }
}
