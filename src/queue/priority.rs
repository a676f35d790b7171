//! Multi-level FIFO queue with per-task timeout tracking.

use super::{PriorityBreakdown, QueueEvent, QueueStats};
use crate::config::QueueConfig;
use crate::error::{PoolError, PoolResult};
use crate::task::{Task, TaskId, TaskPriority};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
struct QueueNode {
    task: Task,
    enqueued_at: Instant,
    seq: u64,
    deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    priority: TaskPriority,
    seq: u64,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    removed: u64,
    expired: u64,
    total_wait: Duration,
}

/// A task whose queue timer elapsed
#[derive(Debug, Clone)]
pub struct ExpiredTask {
    /// The expired task
    pub task: Task,
    /// How long it waited
    pub waited: Duration,
}

/// Priority-then-FIFO task queue.
///
/// Timers are entries in an ordered deadline index keyed by `(deadline, seq)`.
/// Dequeue and removal delete the entry together with the node, so a timer
/// can never fire for a task that already left the queue, and an expired task
/// can never be dequeued.
#[derive(Debug)]
pub struct PriorityTaskQueue {
    buckets: [VecDeque<QueueNode>; 4],
    slots: HashMap<TaskId, Slot>,
    deadlines: BTreeMap<(Instant, u64), TaskId>,
    max_size: usize,
    next_seq: u64,
    counters: Counters,
    subscribers: Vec<mpsc::UnboundedSender<QueueEvent>>,
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PriorityTaskQueue {
    /// Create a queue holding at most `max_size` tasks (0 = unlimited).
    pub fn new(max_size: usize) -> Self {
        Self {
            buckets: Default::default(),
            slots: HashMap::new(),
            deadlines: BTreeMap::new(),
            max_size,
            next_seq: 0,
            counters: Counters::default(),
            subscribers: Vec::new(),
        }
    }

    /// Create a queue from configuration.
    pub fn with_config(config: &QueueConfig) -> Self {
        Self::new(config.max_queue_size)
    }

    /// Receive a copy of every event raised from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Add a task at the tail of its priority bucket.
    ///
    /// Fails without touching the queue if it is full, if the id is already
    /// queued or if the task is malformed.
    pub fn enqueue(&mut self, task: Task) -> PoolResult<()> {
        task.validate()?;

        if self.is_full() {
            return Err(PoolError::QueueFull {
                max_size: self.max_size,
            });
        }

        if self.slots.contains_key(&task.id) {
            return Err(PoolError::DuplicateTask { task_id: task.id });
        }

        let now = Instant::now();
        let seq = self.next_seq;
        self.next_seq += 1;

        let deadline = task.queue_timeout().map(|timeout| now + timeout);
        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, seq), task.id.clone());
        }

        let priority = task.priority;
        let task_id = task.id.clone();
        self.slots.insert(
            task_id.clone(),
            Slot {
                priority,
                seq,
                deadline,
            },
        );
        self.buckets[priority.rank()].push_back(QueueNode {
            task,
            enqueued_at: now,
            seq,
            deadline,
        });
        self.counters.enqueued += 1;

        tracing::trace!("Queued task {} at {} priority", task_id, priority);
        self.emit(QueueEvent::Enqueued { task_id, priority });
        Ok(())
    }

    /// Remove and return the oldest task of the highest non-empty priority.
    pub fn dequeue(&mut self) -> Option<Task> {
        let node = TaskPriority::DESCENDING
            .iter()
            .find_map(|priority| self.buckets[priority.rank()].pop_front())?;

        self.slots.remove(&node.task.id);
        if let Some(deadline) = node.deadline {
            self.deadlines.remove(&(deadline, node.seq));
        }

        let waited = node.enqueued_at.elapsed();
        self.counters.dequeued += 1;
        self.counters.total_wait += waited;

        self.emit(QueueEvent::Dequeued {
            task_id: node.task.id.clone(),
            waited,
        });
        Some(node.task)
    }

    /// The task `dequeue` would return, without removing it.
    pub fn peek(&self) -> Option<&Task> {
        TaskPriority::DESCENDING
            .iter()
            .find_map(|priority| self.buckets[priority.rank()].front())
            .map(|node| &node.task)
    }

    /// Remove a specific task. Returns `None` if it is not queued.
    pub fn remove_task(&mut self, task_id: &str) -> Option<Task> {
        let node = self.take_node(task_id)?;
        self.counters.removed += 1;
        self.emit(QueueEvent::Removed {
            task_id: node.task.id.clone(),
        });
        Some(node.task)
    }

    /// Remove every task whose timer elapsed at or before `now`.
    ///
    /// Each task is returned exactly once.
    pub fn expire_due(&mut self, now: Instant) -> Vec<ExpiredTask> {
        let mut expired = Vec::new();

        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let Some((_, task_id)) = self.deadlines.pop_first() else {
                break;
            };
            let Some(node) = self.take_node(&task_id) else {
                continue;
            };

            let waited = now.saturating_duration_since(node.enqueued_at);
            self.counters.expired += 1;
            tracing::debug!("Task {} expired after waiting {:?}", task_id, waited);
            self.emit(QueueEvent::Expired {
                task_id: task_id.clone(),
                waited,
            });
            expired.push(ExpiredTask {
                task: node.task,
                waited,
            });
        }

        expired
    }

    /// Earliest armed timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines
            .first_key_value()
            .map(|((deadline, _), _)| *deadline)
    }

    /// Whether a task with this id is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.slots.contains_key(task_id)
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the next enqueue would fail for capacity.
    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.slots.len() >= self.max_size
    }

    /// Queued tasks in arrival order, for persistence.
    pub fn snapshot(&self) -> Vec<Task> {
        let mut nodes: Vec<&QueueNode> = self.buckets.iter().flatten().collect();
        nodes.sort_by_key(|node| node.seq);
        nodes.into_iter().map(|node| node.task.clone()).collect()
    }

    /// Empty the queue, returning its tasks in arrival order.
    pub fn drain(&mut self) -> Vec<Task> {
        let mut nodes: Vec<QueueNode> = self
            .buckets
            .iter_mut()
            .flat_map(|bucket| bucket.drain(..))
            .collect();
        nodes.sort_by_key(|node| node.seq);
        self.slots.clear();
        self.deadlines.clear();
        nodes.into_iter().map(|node| node.task).collect()
    }

    /// Current statistics.
    pub fn stats(&self) -> QueueStats {
        let count = |priority: TaskPriority| self.buckets[priority.rank()].len();
        let avg_wait_time = (self.counters.dequeued > 0).then(|| {
            self.counters.total_wait / self.counters.dequeued.min(u32::MAX as u64) as u32
        });

        QueueStats {
            pending: self.len(),
            by_priority: PriorityBreakdown {
                critical: count(TaskPriority::Critical),
                high: count(TaskPriority::High),
                normal: count(TaskPriority::Normal),
                low: count(TaskPriority::Low),
            },
            capacity: (self.max_size > 0).then_some(self.max_size),
            total_enqueued: self.counters.enqueued,
            total_dequeued: self.counters.dequeued,
            total_removed: self.counters.removed,
            total_expired: self.counters.expired,
            avg_wait_time,
        }
    }

    fn take_node(&mut self, task_id: &str) -> Option<QueueNode> {
        let slot = self.slots.remove(task_id)?;
        if let Some(deadline) = slot.deadline {
            self.deadlines.remove(&(deadline, slot.seq));
        }

        let bucket = &mut self.buckets[slot.priority.rank()];
        let position = bucket
            .binary_search_by_key(&slot.seq, |node| node.seq)
            .ok()?;
        bucket.remove(position)
    }

    fn emit(&mut self, event: QueueEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
