//! Error types for forgepool.

use crate::task::TaskError;
use thiserror::Error;

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Main error type for forgepool operations.
///
/// Task-level failures (a handler error, a timeout, a lost worker) are not
/// raised through this type: they arrive as a [`crate::task::TaskOutcome`]
/// with `success == false`. `PoolError` covers everything the caller gets
/// back synchronously from the offending call.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Malformed task or invalid argument
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
    },

    /// The queue reached its configured capacity
    #[error("Queue is full (max size: {max_size})")]
    QueueFull {
        /// Configured capacity
        max_size: usize,
    },

    /// A task with the same id is already queued or running
    #[error("Task '{task_id}' is already queued or running")]
    DuplicateTask {
        /// The offending task id
        task_id: String,
    },

    /// A scale request outside the configured pool bounds
    #[error("Scale target {target} is outside [{min}, {max}]")]
    ScaleOutOfRange {
        /// Requested pool size
        target: usize,
        /// Configured minimum
        min: usize,
        /// Configured maximum
        max: usize,
    },

    /// No handler was registered for the task type
    #[error("No handler registered for task type '{task_type}'")]
    UnknownTaskType {
        /// The unresolved type tag
        task_type: String,
    },

    /// A handler failed while executing a task
    #[error("Task execution failed: {message}")]
    TaskExecutionFailed {
        /// Error message
        message: String,
        /// Underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A submitted task reached a failed terminal state
    #[error("Task '{task_id}' failed: {error}")]
    TaskFailed {
        /// Task identifier
        task_id: String,
        /// Structured failure reported for the task
        error: TaskError,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem error (queue snapshots)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Pool is already running
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running
    #[error("Pool is not running")]
    NotRunning,

    /// Pool stopped accepting work
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// Prometheus registry error
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl PoolError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a task execution error
    pub fn task_execution(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::TaskExecutionFailed {
            message: message.into(),
            source,
        }
    }

    /// Whether this error was raised by input validation.
    ///
    /// Validation errors are never retried by the pool.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::QueueFull { .. }
                | Self::DuplicateTask { .. }
                | Self::ScaleOutOfRange { .. }
                | Self::UnknownTaskType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(PoolError::validation("bad").is_validation());
        assert!(PoolError::QueueFull { max_size: 2 }.is_validation());
        assert!(
            PoolError::ScaleOutOfRange {
                target: 9,
                min: 1,
                max: 4
            }
            .is_validation()
        );
        assert!(!PoolError::ShuttingDown.is_validation());
        assert!(!PoolError::config("oops").is_validation());
    }

    #[test]
    fn test_error_messages() {
        let err = PoolError::QueueFull { max_size: 2 };
        assert_eq!(err.to_string(), "Queue is full (max size: 2)");

        let err = PoolError::task_execution("boom", None);
        assert_eq!(err.to_string(), "Task execution failed: boom");
    }

    #[test]
    fn test_source_is_preserved() {
        let io = std::io::Error::other("disk on fire");
        let err = PoolError::task_execution("write failed", Some(Box::new(io)));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("disk on fire"));
    }
}
