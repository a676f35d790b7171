//! Priority task queue.
//!
//! The queue is a plain data structure owned by the pool's control loop:
//! every method takes `&mut self` and no locking happens inside. Tasks come
//! out highest priority first and FIFO within a priority; tasks that carry a
//! timeout expire in place if nobody dequeues them in time.
//!
//! # Examples
//!
//! ```rust
//! use forgepool::queue::PriorityTaskQueue;
//! use forgepool::task::{Task, TaskPriority};
//!
//! let mut queue = PriorityTaskQueue::new(0);
//! let low = Task::builder().with_type("x").with_data(1).with_priority(TaskPriority::Low).build()?;
//! let high = Task::builder().with_type("x").with_data(2).with_priority(TaskPriority::High).build()?;
//! queue.enqueue(low)?;
//! queue.enqueue(high)?;
//!
//! assert_eq!(queue.dequeue().map(|t| t.priority), Some(TaskPriority::High));
//! # Ok::<(), forgepool::error::PoolError>(())
//! ```

use crate::task::{TaskId, TaskPriority};
use std::time::Duration;

pub mod persistence;
pub mod priority;

pub use persistence::{RestoreReport, load_snapshot, save_snapshot};
pub use priority::{ExpiredTask, PriorityTaskQueue};

/// Pending tasks per priority level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityBreakdown {
    /// Critical tasks waiting
    pub critical: usize,
    /// High-priority tasks waiting
    pub high: usize,
    /// Normal tasks waiting
    pub normal: usize,
    /// Low-priority tasks waiting
    pub low: usize,
}

impl PriorityBreakdown {
    /// Count for one priority
    pub fn get(&self, priority: TaskPriority) -> usize {
        match priority {
            TaskPriority::Critical => self.critical,
            TaskPriority::High => self.high,
            TaskPriority::Normal => self.normal,
            TaskPriority::Low => self.low,
        }
    }
}

/// Statistics about the queue state
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Number of queued tasks
    pub pending: usize,
    /// Queued tasks per priority
    pub by_priority: PriorityBreakdown,
    /// Capacity, if bounded
    pub capacity: Option<usize>,
    /// Tasks accepted since creation
    pub total_enqueued: u64,
    /// Tasks handed out by `dequeue`
    pub total_dequeued: u64,
    /// Tasks removed by id
    pub total_removed: u64,
    /// Tasks that expired while queued
    pub total_expired: u64,
    /// Mean wait between enqueue and dequeue
    pub avg_wait_time: Option<Duration>,
}

/// Notifications raised by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A task was accepted
    Enqueued {
        task_id: TaskId,
        priority: TaskPriority,
    },
    /// A task left the queue for dispatch
    Dequeued { task_id: TaskId, waited: Duration },
    /// A task was removed by id
    Removed { task_id: TaskId },
    /// A task's timer elapsed before it was dequeued
    Expired { task_id: TaskId, waited: Duration },
}
