//! In-memory `TaskStore` — for tests and single-process development runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DatabaseError;
use crate::store::traits::TaskStore;
use crate::tasks::model::{NewTask, StatusUpdate, Task, TaskStatus};

#[derive(Default)]
struct Inner {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
}

/// Task store held entirely in process memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Validate `update` against the stored task and apply it in place.
fn apply_update(task: &mut Task, update: &StatusUpdate) -> Result<(), DatabaseError> {
    if let Some(expected) = update.expected_version {
        if task.version != expected {
            return Err(DatabaseError::Conflict {
                id: task.id,
                reason: format!("expected version {expected}, found {}", task.version),
            });
        }
    }
    if !task.status.can_transition_to(update.status) {
        return Err(DatabaseError::Conflict {
            id: task.id,
            reason: format!("cannot move from {} to {}", task.status, update.status),
        });
    }

    task.status = update.status;
    if let Some(started_at) = update.started_at {
        task.started_at = Some(started_at);
    }
    if let Some(ended_at) = update.ended_at {
        task.ended_at = Some(ended_at);
    }
    if update.status == TaskStatus::Processing {
        task.attempts += 1;
    }
    task.version += 1;
    Ok(())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, new: NewTask) -> Result<Task, DatabaseError> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let task = Task {
            id: inner.next_id,
            text: new.text,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            user_id: new.user_id,
            version: 0,
            attempts: 0,
        };
        inner.tasks.insert(task.id, task.clone());
        debug!(task_id = task.id, "Task created");
        Ok(task)
    }

    async fn get(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>, DatabaseError> {
        Ok(self.inner.read().await.tasks.values().cloned().collect())
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        Ok(self
            .inner
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn update_text(&self, id: i64, text: &str) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { id })?;
        task.text = text.to_string();
        Ok(())
    }

    async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { id })?;
        apply_update(task, &update)
    }

    async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        Ok(self.inner.write().await.tasks.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_sequential_ids() {
        let store = InMemoryTaskStore::new();
        let a = store.create(NewTask::new("u", "first")).await.unwrap();
        let b = store.create(NewTask::new("u", "second")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.version, 0);
    }

    #[tokio::test]
    async fn list_by_status_filters_and_orders() {
        let store = InMemoryTaskStore::new();
        for i in 0..3 {
            store.create(NewTask::new("u", format!("t{i}"))).await.unwrap();
        }
        store
            .update_status(2, StatusUpdate::processing(Utc::now()))
            .await
            .unwrap();

        let pending = store.list_by_status(TaskStatus::Pending).await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn partial_update_keeps_started_at() {
        let store = InMemoryTaskStore::new();
        let task = store.create(NewTask::new("u", "t")).await.unwrap();
        let start = Utc::now();
        store
            .update_status(task.id, StatusUpdate::processing(start))
            .await
            .unwrap();
        let end = Utc::now();
        store
            .update_status(task.id, StatusUpdate::completed(end))
            .await
            .unwrap();

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.started_at, Some(start));
        assert_eq!(stored.ended_at, Some(end));
        assert_eq!(stored.version, 2);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryTaskStore::new();
        let task = store.create(NewTask::new("u", "t")).await.unwrap();
        store
            .update_status(task.id, StatusUpdate::processing(Utc::now()).expecting(0))
            .await
            .unwrap();

        let err = store
            .update_status(task.id, StatusUpdate::completed(Utc::now()).expecting(0))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { id, .. } if id == task.id));
    }

    #[tokio::test]
    async fn backward_transition_rejected() {
        let store = InMemoryTaskStore::new();
        let task = store.create(NewTask::new("u", "t")).await.unwrap();
        store
            .update_status(task.id, StatusUpdate::processing(Utc::now()))
            .await
            .unwrap();
        store
            .update_status(task.id, StatusUpdate::completed(Utc::now()))
            .await
            .unwrap();

        let err = store
            .update_status(task.id, StatusUpdate::to(TaskStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let err = store
            .update_status(99, StatusUpdate::to(TaskStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { id: 99 }));
        assert!(store.update_text(99, "x").await.is_err());
        assert!(!store.delete(99).await.unwrap());
    }
}
