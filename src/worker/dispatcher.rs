//! Dispatcher — polls the store for pending tasks and feeds the queue.
//!
//! Each tick first reclaims stale `processing` tasks, then lists `pending`
//! tasks and enqueues the ones the queue is not already tracking. On the
//! first tick every orphaned `processing` task is reclaimed regardless of
//! age (no in-process work survives a restart).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::DatabaseError;
use crate::notify::Notifier;
use crate::store::traits::{TaskStore, with_timeout};
use crate::tasks::model::{StatusUpdate, Task, TaskStatus, TaskStatusEvent};
use crate::worker::queue::TaskQueue;
use crate::worker::stats::DispatchStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    Stopped,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<DispatchStats>,
    config: DispatchConfig,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<TaskQueue>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<DispatchStats>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            stats,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DispatcherState {
        if self.running.load(Ordering::Acquire) {
            DispatcherState::Running
        } else {
            DispatcherState::Stopped
        }
    }

    /// Spawn the polling loop onto the runtime.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Poll until `cancel` fires. The first tick fires immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        self.running.store(true, Ordering::Release);
        let mut period = self.config.poll_interval;
        if period.is_zero() {
            period = DispatchConfig::default().poll_interval;
            warn!(
                fallback_ms = period.as_millis() as u64,
                "Poll interval is zero, using the default"
            );
        }
        info!(interval_ms = period.as_millis() as u64, "Dispatcher started");

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first = true;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let threshold = if first && self.config.reclaim_on_start {
                        Duration::ZERO
                    } else {
                        self.config.stale_after
                    };
                    first = false;
                    // Failures are already logged; the next tick retries.
                    let _ = self.reclaim_older_than(threshold, &cancel).await;
                    let _ = self.poll_once(&cancel).await;
                }
                _ = cancel.cancelled() => {
                    info!("Dispatcher received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!("Dispatcher stopped");
    }

    /// One pending poll. Returns how many tasks were enqueued.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<usize, DatabaseError> {
        self.stats.record_poll();

        let query = with_timeout(
            "list_by_status",
            self.config.query_timeout,
            self.store.list_by_status(TaskStatus::Pending),
        );
        let result = tokio::select! {
            result = query => result,
            _ = cancel.cancelled() => return Ok(0),
        };

        let tasks = match result {
            Ok(tasks) => tasks,
            Err(e) => {
                self.stats.record_poll_error();
                warn!(error = %e, "Failed to list pending tasks, skipping tick");
                return Err(e);
            }
        };

        if tasks.is_empty() {
            return Ok(0);
        }
        debug!(count = tasks.len(), "Found pending tasks");

        let mut enqueued = 0;
        for task in tasks {
            let id = task.id;
            if self.queue.contains(id).await {
                debug!(task_id = id, "Task already queued, skipping");
                continue;
            }
            if task.attempts >= self.config.max_attempts {
                self.retire(&task).await;
                continue;
            }
            match self.queue.add_until(task, cancel).await {
                Ok(()) => {
                    enqueued += 1;
                    self.stats.record_enqueued();
                }
                Err(e) => {
                    debug!(task_id = id, error = %e, "Stopped enqueueing");
                    break;
                }
            }
        }

        if enqueued > 0 {
            info!(count = enqueued, "Enqueued pending tasks");
        }
        Ok(enqueued)
    }

    /// Reclaim `processing` tasks older than `stale_after`. Returns how many
    /// tasks were moved out of `processing`.
    pub async fn reclaim_stale(&self, cancel: &CancellationToken) -> Result<usize, DatabaseError> {
        self.reclaim_older_than(self.config.stale_after, cancel).await
    }

    async fn reclaim_older_than(
        &self,
        threshold: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, DatabaseError> {
        let query = with_timeout(
            "list_by_status",
            self.config.query_timeout,
            self.store.list_by_status(TaskStatus::Processing),
        );
        let result = tokio::select! {
            result = query => result,
            _ = cancel.cancelled() => return Ok(0),
        };

        let processing = match result {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to list processing tasks for reclaim");
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut reclaimed = 0;
        for task in processing {
            if cancel.is_cancelled() {
                break;
            }
            // In flight here; the worker owns it.
            if self.queue.contains(task.id).await {
                continue;
            }
            let stale = match task.started_at {
                Some(started) => (now - started)
                    .to_std()
                    .map(|age| age >= threshold)
                    // started_at ahead of our clock
                    .unwrap_or(threshold.is_zero()),
                None => true,
            };
            if !stale {
                continue;
            }
            if self.retire(&task).await {
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "Reclaimed stale processing tasks");
        }
        Ok(reclaimed)
    }

    /// Move a task back to `pending`, or to `failed` once its attempts are
    /// exhausted. Version-checked against the copy we listed.
    async fn retire(&self, task: &Task) -> bool {
        let target = if task.attempts >= self.config.max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
        let update = StatusUpdate::to(target).expecting(task.version);

        let result = with_timeout(
            "update_status",
            self.config.store_timeout,
            self.store.update_status(task.id, update),
        )
        .await;

        match result {
            Ok(()) => {
                if target == TaskStatus::Failed {
                    self.stats.record_dead_lettered();
                    warn!(
                        task_id = task.id,
                        attempts = task.attempts,
                        "Task exhausted its attempts, marked failed"
                    );
                } else {
                    self.stats.record_reclaimed();
                    info!(task_id = task.id, attempts = task.attempts, "Reset stale task to pending");
                }
                self.notifier.notify(
                    &task.user_id,
                    TaskStatusEvent::new(task, target, Utc::now()),
                );
                true
            }
            Err(DatabaseError::Conflict { .. } | DatabaseError::NotFound { .. }) => {
                debug!(task_id = task.id, "Task changed during reclaim, leaving it");
                false
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Failed to reclaim stale task");
                false
            }
        }
    }
}
