//! Read-through caching decorator for any `TaskStore`.
//!
//! Point lookups and the full listing are cached; every write invalidates the
//! keys it affects. `list_by_status` always goes to the inner store so the
//! dispatcher never polls a stale backlog.
//!
//! Writes run on a detached task that invalidates before and after touching
//! the inner store, so a caller that drops or times out the write cannot
//! leave a stale entry behind. A write epoch guards the fill side: a read
//! only populates the cache if no write started or finished while it was
//! reading.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cache::{CacheStatsSnapshot, MemoryCache};
use crate::config::CacheConfig;
use crate::error::DatabaseError;
use crate::store::traits::TaskStore;
use crate::tasks::model::{NewTask, StatusUpdate, Task, TaskStatus};

/// TTL for the full task listing.
pub const TTL_ALL_TASKS: Duration = Duration::from_secs(60);
/// TTL for a single task.
pub const TTL_SINGLE_TASK: Duration = Duration::from_secs(300);

const ALL_TASKS_KEY: &str = "tasks:all";

fn task_key(id: i64) -> String {
    format!("task:{id}")
}

struct Shared<S> {
    inner: S,
    tasks: Arc<MemoryCache<Task>>,
    listings: Arc<MemoryCache<Vec<Task>>>,
    /// Bumped under the lock on every invalidation.
    epoch: Mutex<u64>,
}

impl<S> Shared<S> {
    async fn invalidate(&self, id: Option<i64>) {
        let mut epoch = self.epoch.lock().await;
        *epoch += 1;
        if let Some(id) = id {
            self.tasks.delete(&task_key(id)).await;
        }
        self.listings.delete(ALL_TASKS_KEY).await;
    }

    async fn epoch(&self) -> u64 {
        *self.epoch.lock().await
    }
}

/// `TaskStore` wrapper that caches reads in memory.
pub struct CachedTaskStore<S> {
    shared: Arc<Shared<S>>,
}

impl<S: TaskStore + 'static> CachedTaskStore<S> {
    pub fn new(inner: S, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner,
                tasks: MemoryCache::new(config.clone()),
                listings: MemoryCache::new(config),
                epoch: Mutex::new(0),
            }),
        }
    }

    /// The per-task cache, e.g. to hand to `cache::spawn_sweeper`.
    pub fn task_cache(&self) -> &Arc<MemoryCache<Task>> {
        &self.shared.tasks
    }

    /// The listing cache, e.g. to hand to `cache::spawn_sweeper`.
    pub fn listing_cache(&self) -> &Arc<MemoryCache<Vec<Task>>> {
        &self.shared.listings
    }

    /// Combined hit/miss counters for both caches.
    pub fn stats(&self) -> CacheStatsSnapshot {
        let a = self.shared.tasks.stats();
        let b = self.shared.listings.stats();
        CacheStatsSnapshot {
            hits: a.hits + b.hits,
            misses: a.misses + b.misses,
            sets: a.sets + b.sets,
            deletes: a.deletes + b.deletes,
            expirations: a.expirations + b.expirations,
        }
    }
}

/// Wait for a detached write.
async fn joined<T>(handle: JoinHandle<Result<T, DatabaseError>>) -> Result<T, DatabaseError> {
    handle
        .await
        .map_err(|e| DatabaseError::Query(format!("cached write task failed: {e}")))?
}

#[async_trait]
impl<S: TaskStore + 'static> TaskStore for CachedTaskStore<S> {
    async fn create(&self, task: NewTask) -> Result<Task, DatabaseError> {
        let shared = Arc::clone(&self.shared);
        joined(tokio::spawn(async move {
            shared.invalidate(None).await;
            let result = shared.inner.create(task).await;
            shared.invalidate(None).await;
            result
        }))
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let key = task_key(id);
        if let Some(task) = self.shared.tasks.get(&key).await {
            return Ok(Some(task));
        }
        let seen = self.shared.epoch().await;
        let task = self.shared.inner.get(id).await?;
        if let Some(ref task) = task {
            let epoch = self.shared.epoch.lock().await;
            if *epoch == seen {
                self.shared
                    .tasks
                    .set(key, task.clone(), TTL_SINGLE_TASK)
                    .await;
            }
        }
        Ok(task)
    }

    async fn get_fresh(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        self.shared.inner.get_fresh(id).await
    }

    async fn list(&self) -> Result<Vec<Task>, DatabaseError> {
        if let Some(tasks) = self.shared.listings.get(ALL_TASKS_KEY).await {
            return Ok(tasks);
        }
        let seen = self.shared.epoch().await;
        let tasks = self.shared.inner.list().await?;
        let epoch = self.shared.epoch.lock().await;
        if *epoch == seen {
            self.shared
                .listings
                .set(ALL_TASKS_KEY, tasks.clone(), TTL_ALL_TASKS)
                .await;
        }
        Ok(tasks)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.shared.inner.list_by_status(status).await
    }

    async fn update_text(&self, id: i64, text: &str) -> Result<(), DatabaseError> {
        let shared = Arc::clone(&self.shared);
        let text = text.to_owned();
        joined(tokio::spawn(async move {
            shared.invalidate(Some(id)).await;
            let result = shared.inner.update_text(id, &text).await;
            shared.invalidate(Some(id)).await;
            result
        }))
        .await
    }

    async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<(), DatabaseError> {
        let shared = Arc::clone(&self.shared);
        joined(tokio::spawn(async move {
            shared.invalidate(Some(id)).await;
            let result = shared.inner.update_status(id, update).await;
            shared.invalidate(Some(id)).await;
            result
        }))
        .await
    }

    async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        let shared = Arc::clone(&self.shared);
        joined(tokio::spawn(async move {
            shared.invalidate(Some(id)).await;
            let result = shared.inner.delete(id).await;
            shared.invalidate(Some(id)).await;
            result
        }))
        .await
    }
}
