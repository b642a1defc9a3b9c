//! Task queue — bounded in-process handoff from the dispatcher to workers.
//!
//! A fixed-capacity channel carries the tasks; a mutex-guarded side map
//! tracks every task that is queued or in flight so it can be inspected and
//! deduplicated. Workers evict their task from the map once they are done
//! with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::QueueError;
use crate::tasks::model::Task;

/// Default channel capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A tracked copy of a queued task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub task: Task,
    /// Monotonic enqueue order.
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Shared consumption handle. Each task is received by exactly one holder.
#[derive(Clone)]
pub struct TaskReceiver {
    inner: Arc<Mutex<mpsc::Receiver<Task>>>,
}

impl TaskReceiver {
    /// Wait for the next task. Cancel-safe: dropping the future loses nothing.
    pub async fn recv(&self) -> Option<Task> {
        self.inner.lock().await.recv().await
    }
}

/// Bounded FIFO of ready-to-run tasks.
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: TaskReceiver,
    entries: Mutex<HashMap<i64, QueueEntry>>,
    sequence: AtomicU64,
    capacity: usize,
}

impl TaskQueue {
    /// Create a queue whose channel holds at most `capacity` tasks.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            tx,
            rx: TaskReceiver {
                inner: Arc::new(Mutex::new(rx)),
            },
            entries: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            capacity,
        })
    }

    /// Track `task` and push it onto the channel.
    ///
    /// Waits while the channel is full; this is the dispatcher's only
    /// backpressure. Never drops the task and never fails.
    pub async fn add(&self, task: Task) {
        self.track(&task).await;
        // The queue owns a receiver, so the channel cannot close under us.
        let _ = self.tx.send(task).await;
    }

    /// Like [`add`](Self::add), but gives up if `cancel` fires while waiting
    /// for space.
    pub async fn add_until(&self, task: Task, cancel: &CancellationToken) -> Result<(), QueueError> {
        let id = task.id;
        self.track(&task).await;
        tokio::select! {
            _ = self.tx.send(task) => Ok(()),
            _ = cancel.cancelled() => {
                self.remove(id).await;
                Err(QueueError::Cancelled { id })
            }
        }
    }

    async fn track(&self, task: &Task) {
        let entry = QueueEntry {
            task: task.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Utc::now(),
        };
        self.entries.lock().await.insert(task.id, entry);
        debug!(task_id = task.id, "Task queued");
    }

    /// The consumption handle shared by all workers.
    pub fn tasks(&self) -> TaskReceiver {
        self.rx.clone()
    }

    /// Snapshot of every tracked task, ordered by id.
    pub async fn get_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .entries
            .lock()
            .await
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Snapshot of every tracked entry, in enqueue order.
    pub async fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.entries.lock().await.values().cloned().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Stop tracking a task. Returns whether it was tracked.
    pub async fn remove(&self, id: i64) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    /// Whether a task is queued or in flight.
    pub async fn contains(&self, id: i64) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    /// Number of tracked tasks (queued plus in flight).
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Tasks sitting in the channel, not yet received by a worker.
    pub fn buffered(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
