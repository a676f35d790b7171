//! Messages exchanged between the pool manager and its workers.
//!
//! Every message travels inside an [`Envelope`] carrying the optional task id
//! and a timestamp. The vocabulary is closed: a worker only ever receives a
//! [`ManagerMessage`] and only ever answers with a [`WorkerMessage`].

use crate::core::registry::HandlerId;
use crate::task::{Task, TaskError, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Unique identifier of a worker within a pool
pub type WorkerId = usize;

/// Wire name of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    TaskAssignment,
    TaskResult,
    TaskError,
    TaskProgress,
    WorkerReady,
    WorkerShutdown,
    HealthCheck,
    MemoryWarning,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::TaskAssignment => "task-assignment",
            MessageType::TaskResult => "task-result",
            MessageType::TaskError => "task-error",
            MessageType::TaskProgress => "task-progress",
            MessageType::WorkerReady => "worker-ready",
            MessageType::WorkerShutdown => "worker-shutdown",
            MessageType::HealthCheck => "health-check",
            MessageType::MemoryWarning => "memory-warning",
        };
        f.write_str(name)
    }
}

/// Common framing for both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// Task the message refers to, if any
    pub task_id: Option<TaskId>,
    /// Message body
    pub payload: P,
    /// When the message was produced
    pub timestamp: SystemTime,
}

impl<P: Payload> Envelope<P> {
    /// Wrap a payload with the current time.
    pub fn new(task_id: Option<TaskId>, payload: P) -> Self {
        Self {
            task_id,
            payload,
            timestamp: SystemTime::now(),
        }
    }

    /// Wire name of the wrapped payload.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Implemented by both message directions.
pub trait Payload {
    /// Wire name of this payload
    fn message_type(&self) -> MessageType;
}

/// Manager → worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ManagerMessage {
    /// Deliver a task. `handler` indexes the worker's handler table.
    TaskAssignment { task: Task, handler: HandlerId },
    /// Finish (or abandon) the current task and exit
    WorkerShutdown,
    /// Liveness probe; the worker echoes `seq`
    HealthCheck { seq: u64 },
}

impl Payload for ManagerMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ManagerMessage::TaskAssignment { .. } => MessageType::TaskAssignment,
            ManagerMessage::WorkerShutdown => MessageType::WorkerShutdown,
            ManagerMessage::HealthCheck { .. } => MessageType::HealthCheck,
        }
    }
}

/// Worker → manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Sent once, after the handler table is loaded
    WorkerReady,
    /// Successful completion
    TaskResult {
        result: serde_json::Value,
        execution_time: Duration,
        memory_usage: u64,
    },
    /// Failed completion
    TaskError {
        error: TaskError,
        execution_time: Duration,
        memory_usage: u64,
    },
    /// Intermediate progress, in percent
    TaskProgress { progress: f32 },
    /// Answer to [`ManagerMessage::HealthCheck`]
    HealthCheck { seq: u64, memory_usage: u64 },
    /// Memory usage crossed the warning ratio or the limit itself
    MemoryWarning { usage: u64, limit: u64 },
}

impl Payload for WorkerMessage {
    fn message_type(&self) -> MessageType {
        match self {
            WorkerMessage::WorkerReady => MessageType::WorkerReady,
            WorkerMessage::TaskResult { .. } => MessageType::TaskResult,
            WorkerMessage::TaskError { .. } => MessageType::TaskError,
            WorkerMessage::TaskProgress { .. } => MessageType::TaskProgress,
            WorkerMessage::HealthCheck { .. } => MessageType::HealthCheck,
            WorkerMessage::MemoryWarning { .. } => MessageType::MemoryWarning,
        }
    }
}

impl WorkerMessage {
    /// Whether this message ends the task it refers to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerMessage::TaskResult { .. } | WorkerMessage::TaskError { .. }
        )
    }
}
