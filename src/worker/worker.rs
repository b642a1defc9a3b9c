//! Worker pool — claims queued tasks, runs them and records completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::DatabaseError;
use crate::notify::Notifier;
use crate::store::traits::{TaskStore, with_timeout};
use crate::tasks::model::{StatusUpdate, Task, TaskStatus, TaskStatusEvent};
use crate::worker::queue::TaskQueue;
use crate::worker::stats::DispatchStats;

/// Shared dependencies for every worker in the pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<TaskQueue>,
    pub notifier: Arc<dyn Notifier>,
    pub stats: Arc<DispatchStats>,
    pub config: DispatchConfig,
}

/// A single consumer of the task queue.
pub struct Worker {
    id: usize,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(id: usize, deps: WorkerDeps) -> Self {
        Self { id, deps }
    }

    fn store(&self) -> &Arc<dyn TaskStore> {
        &self.deps.store
    }

    fn config(&self) -> &DispatchConfig {
        &self.deps.config
    }

    /// Consume tasks until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker_id = self.id, "Worker started");
        let tasks = self.deps.queue.tasks();

        loop {
            let task = tokio::select! {
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let id = task.id;
            self.process(task, &cancel).await;
            self.deps.queue.remove(id).await;
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    async fn process(&self, task: Task, cancel: &CancellationToken) {
        let start = Utc::now();
        info!(worker_id = self.id, task_id = task.id, text = %task.text, "Processing task");

        let claim = StatusUpdate::processing(start).expecting(task.version);
        if let Err(e) = self.transition(&task, claim, cancel).await {
            match e {
                DatabaseError::Conflict { .. } | DatabaseError::NotFound { .. } => {
                    debug!(worker_id = self.id, task_id = task.id, error = %e, "Task taken or removed, skipping");
                }
                e => {
                    self.deps.stats.record_abandoned();
                    warn!(
                        worker_id = self.id,
                        task_id = task.id,
                        error = %e,
                        "Failed to claim task, leaving it pending"
                    );
                }
            }
            return;
        }
        self.deps.stats.record_claimed();
        self.notify(&task, TaskStatus::Processing, start);

        let work = self.work_duration();
        tokio::select! {
            _ = tokio::time::sleep(work) => {}
            _ = cancel.cancelled() => {
                info!(worker_id = self.id, task_id = task.id, "Shutdown during work, task left processing");
                return;
            }
        }

        // ended_at must be strictly after started_at
        let end = Utc::now().max(start + TimeDelta::microseconds(1));
        let complete = StatusUpdate::completed(end).expecting(task.version + 1);
        if let Err(e) = self.transition(&task, complete, cancel).await {
            self.deps.stats.record_abandoned();
            if matches!(e, DatabaseError::Conflict { .. }) {
                warn!(worker_id = self.id, task_id = task.id, error = %e, "Lost update on completion");
            } else {
                warn!(
                    worker_id = self.id,
                    task_id = task.id,
                    error = %e,
                    "Failed to complete task, leaving it for reclaim"
                );
            }
            return;
        }

        self.deps
            .stats
            .record_processing_time((end - start).to_std().unwrap_or_default());
        self.deps.stats.record_completed();
        self.notify(&task, TaskStatus::Completed, end);
        info!(
            worker_id = self.id,
            task_id = task.id,
            elapsed_ms = (end - start).num_milliseconds(),
            "Task completed"
        );
    }

    /// Apply `update`, retrying transient errors with exponential backoff.
    async fn transition(
        &self,
        task: &Task,
        update: StatusUpdate,
        cancel: &CancellationToken,
    ) -> Result<(), DatabaseError> {
        let mut backoff = self.config().retry_backoff;
        let mut retries = 0;

        loop {
            let result = with_timeout(
                "update_status",
                self.config().store_timeout,
                self.store().update_status(task.id, update),
            )
            .await;

            match result {
                Ok(()) => return Ok(()),
                // A timed-out attempt may still have landed.
                Err(e @ DatabaseError::Conflict { .. }) if retries > 0 => {
                    return if self.already_applied(task.id, update).await {
                        Ok(())
                    } else {
                        Err(e)
                    };
                }
                Err(e) if e.is_transient() && retries < self.config().update_retries => {
                    retries += 1;
                    warn!(
                        worker_id = self.id,
                        task_id = task.id,
                        attempt = retries,
                        error = %e,
                        "Status update failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(e),
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn already_applied(&self, id: i64, update: StatusUpdate) -> bool {
        let current = with_timeout(
            "get_fresh",
            self.config().store_timeout,
            self.store().get_fresh(id),
        )
        .await;
        match (current, update.expected_version) {
            (Ok(Some(task)), Some(expected)) => {
                task.status == update.status && task.version == expected + 1
            }
            _ => false,
        }
    }

    fn notify(&self, task: &Task, status: TaskStatus, at: chrono::DateTime<Utc>) {
        self.deps
            .notifier
            .notify(&task.user_id, TaskStatusEvent::new(task, status, at));
    }

    fn work_duration(&self) -> Duration {
        let min = self.config().work_min.as_millis() as u64;
        let max = self.config().work_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Spawn `count` workers sharing `deps`, numbered from 1.
pub fn spawn_workers(
    deps: WorkerDeps,
    count: usize,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (1..=count)
        .map(|id| {
            let worker = Worker::new(id, deps.clone());
            tokio::spawn(worker.run(cancel.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::store::memory::InMemoryTaskStore;
    use crate::tasks::model::NewTask;
    use crate::worker::dispatcher::Dispatcher;

    /// Wraps the in-memory store, records status updates and can fail the
    /// first `fail_updates` of them.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryTaskStore,
        updates: Mutex<Vec<(i64, TaskStatus)>>,
        fail_updates: AtomicU32,
        /// Apply the next N updates, then report a timeout anyway.
        lost_acks: AtomicU32,
        /// Reject every move to `completed`.
        fail_completions: AtomicBool,
    }

    impl RecordingStore {
        fn failing(n: u32) -> Self {
            Self {
                fail_updates: AtomicU32::new(n),
                ..Self::default()
            }
        }

        fn updates(&self) -> Vec<(i64, TaskStatus)> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskStore for RecordingStore {
        async fn create(&self, task: NewTask) -> Result<Task, DatabaseError> {
            self.inner.create(task).await
        }
        async fn get(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
            self.inner.get(id).await
        }
        async fn list(&self) -> Result<Vec<Task>, DatabaseError> {
            self.inner.list().await
        }
        async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
            self.inner.list_by_status(status).await
        }
        async fn update_text(&self, id: i64, text: &str) -> Result<(), DatabaseError> {
            self.inner.update_text(id, text).await
        }
        async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<(), DatabaseError> {
            let remaining = self.fail_updates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_updates.store(remaining - 1, Ordering::SeqCst);
                return Err(DatabaseError::Unavailable("injected".into()));
            }
            if update.status == TaskStatus::Completed
                && self.fail_completions.load(Ordering::SeqCst)
            {
                return Err(DatabaseError::Unavailable("injected".into()));
            }
            self.inner.update_status(id, update).await?;
            self.updates.lock().unwrap().push((id, update.status));
            let lost = self.lost_acks.load(Ordering::SeqCst);
            if lost > 0 {
                self.lost_acks.store(lost - 1, Ordering::SeqCst);
                return Err(DatabaseError::Timeout {
                    operation: "update_status",
                    timeout: Duration::from_millis(1),
                });
            }
            Ok(())
        }
        async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
            self.inner.delete(id).await
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            work_min: Duration::from_millis(1),
            work_max: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(1),
            ..DispatchConfig::default()
        }
    }

    fn deps(store: Arc<RecordingStore>, notifier: Arc<dyn Notifier>) -> WorkerDeps {
        WorkerDeps {
            store,
            queue: TaskQueue::new(8),
            notifier,
            stats: Arc::new(DispatchStats::default()),
            config: config(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn task_goes_pending_processing_completed() {
        let store = Arc::new(RecordingStore::default());
        let notifier = BroadcastNotifier::new();
        let mut events = notifier.subscribe();
        let deps = deps(Arc::clone(&store), Arc::new(notifier));
        let task = store.create(NewTask::new("u1", "work")).await.unwrap();

        let cancel = CancellationToken::new();
        let handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(task.clone()).await;

        wait_for(|| store.updates().len() == 2).await;
        assert_eq!(
            store.updates(),
            vec![(task.id, TaskStatus::Processing), (task.id, TaskStatus::Completed)]
        );

        let done = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.started_at.unwrap() < done.ended_at.unwrap());

        let first = events.recv().await.unwrap();
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.event.status, TaskStatus::Processing);
        assert_eq!(events.recv().await.unwrap().event.status, TaskStatus::Completed);

        wait_for(|| deps.stats.snapshot().completed == 1).await;
        assert_eq!(deps.stats.snapshot().processing_count, 1);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(deps.queue.is_empty().await);
    }

    #[tokio::test]
    async fn claim_that_landed_before_a_timeout_is_kept() {
        let store = Arc::new(RecordingStore {
            lost_acks: AtomicU32::new(1),
            ..RecordingStore::default()
        });
        let deps = deps(Arc::clone(&store), Arc::new(crate::notify::NoopNotifier));
        let task = store.create(NewTask::new("u", "t")).await.unwrap();

        let cancel = CancellationToken::new();
        let _handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(task.clone()).await;

        let stats = Arc::clone(&deps.stats);
        wait_for(|| stats.snapshot().completed == 1).await;
        let snap = stats.snapshot();
        assert_eq!(snap.claimed, 1);
        assert_eq!(snap.abandoned, 0);
        assert_eq!(
            store.updates(),
            vec![(task.id, TaskStatus::Processing), (task.id, TaskStatus::Completed)]
        );
        let done = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(done.attempts, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_completion_is_reclaimed_later() {
        let store = Arc::new(RecordingStore {
            fail_completions: AtomicBool::new(true),
            ..RecordingStore::default()
        });
        let deps = deps(Arc::clone(&store), Arc::new(crate::notify::NoopNotifier));
        let task = store.create(NewTask::new("u", "t")).await.unwrap();

        let cancel = CancellationToken::new();
        let _handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(task.clone()).await;

        let stats = Arc::clone(&deps.stats);
        wait_for(|| stats.snapshot().abandoned == 1).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while deps.queue.contains(task.id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker kept the task tracked");

        let stuck = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Processing);
        assert_eq!(stats.snapshot().completed, 0);

        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::clone(&deps.queue),
            Arc::new(crate::notify::NoopNotifier),
            Arc::clone(&stats),
            DispatchConfig {
                stale_after: Duration::ZERO,
                ..config()
            },
        );
        assert_eq!(dispatcher.reclaim_stale(&cancel).await.unwrap(), 1);
        let back = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(stats.snapshot().reclaimed, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn transient_claim_error_is_retried() {
        let store = Arc::new(RecordingStore::failing(1));
        let deps = deps(Arc::clone(&store), Arc::new(crate::notify::NoopNotifier));
        let task = store.create(NewTask::new("u", "t")).await.unwrap();

        let cancel = CancellationToken::new();
        let _handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(task.clone()).await;

        wait_for(|| store.updates().len() == 2).await;
        assert_eq!(deps.stats.snapshot().abandoned, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn exhausted_claim_retries_leave_task_pending() {
        // One initial attempt plus two retries.
        let store = Arc::new(RecordingStore::failing(3));
        let deps = deps(Arc::clone(&store), Arc::new(crate::notify::NoopNotifier));
        let task = store.create(NewTask::new("u", "t")).await.unwrap();

        let cancel = CancellationToken::new();
        let _handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(task.clone()).await;

        let stats = Arc::clone(&deps.stats);
        wait_for(|| stats.snapshot().abandoned == 1).await;
        assert!(store.updates().is_empty());
        let task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        cancel.cancel();
    }

    #[tokio::test]
    async fn changed_task_is_skipped() {
        let store = Arc::new(RecordingStore::default());
        let deps = deps(Arc::clone(&store), Arc::new(crate::notify::NoopNotifier));
        let stale = store.create(NewTask::new("u", "stale")).await.unwrap();
        let fresh = store.create(NewTask::new("u", "fresh")).await.unwrap();
        // Changed behind the worker's back after it was queued.
        store
            .inner
            .update_status(stale.id, StatusUpdate::to(TaskStatus::Failed))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let _handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(stale.clone()).await;
        deps.queue.add(fresh.clone()).await;

        // One worker handles the queue in order, so the stale task is done
        // once the fresh one completes.
        wait_for(|| store.updates().len() == 2).await;
        assert!(store.updates().iter().all(|(id, _)| *id == fresh.id));
        assert_eq!(deps.stats.snapshot().claimed, 1);
        assert_eq!(deps.stats.snapshot().abandoned, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_during_work_leaves_task_processing() {
        let store = Arc::new(RecordingStore::default());
        let mut deps = deps(Arc::clone(&store), Arc::new(crate::notify::NoopNotifier));
        deps.config.work_min = Duration::from_secs(30);
        deps.config.work_max = Duration::from_secs(30);
        let task = store.create(NewTask::new("u", "t")).await.unwrap();

        let cancel = CancellationToken::new();
        let handles = spawn_workers(deps.clone(), 1, cancel.clone());
        deps.queue.add(task.clone()).await;

        wait_for(|| store.updates().len() == 1).await;
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker did not stop")
                .unwrap();
        }

        let task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.ended_at.is_none());
    }
}
