//! `TaskStore` trait — the async persistence contract for tasks.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::tasks::model::{NewTask, StatusUpdate, Task, TaskStatus};

/// Backend-agnostic task repository.
///
/// Implementations must tolerate concurrent calls from the dispatcher and
/// every worker.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` task and return it with its assigned id.
    async fn create(&self, task: NewTask) -> Result<Task, DatabaseError>;

    /// Point lookup.
    async fn get(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// Point lookup that skips any caching layer and reads the backend.
    async fn get_fresh(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        self.get(id).await
    }

    /// Every task, ordered by id.
    async fn list(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks with the given status, ordered by id.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// Replace a task's text.
    async fn update_text(&self, id: i64, text: &str) -> Result<(), DatabaseError>;

    /// Apply a partial status update atomically.
    ///
    /// Only `Some` timestamps are written. Fails with `Conflict` when the
    /// transition is not allowed from the stored status or when
    /// `expected_version` does not match. Bumps `version`, and bumps
    /// `attempts` when moving to `processing`.
    async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<(), DatabaseError>;

    /// Delete a task. Returns whether it existed.
    async fn delete(&self, id: i64) -> Result<bool, DatabaseError>;
}

/// Bound a store call by `timeout`, mapping expiry to `DatabaseError::Timeout`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DatabaseError::Timeout { operation, timeout })?
}
