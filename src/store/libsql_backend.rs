//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Status updates are a single
//! conditional `UPDATE`, so the transition check, the version check and the
//! partial timestamp write are atomic.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{NewTask, StatusUpdate, Task, TaskStatus};

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Unavailable(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    /// Explain why a conditional update touched no rows.
    async fn diagnose_missed_update(
        &self,
        id: i64,
        update: &StatusUpdate,
    ) -> Result<DatabaseError, DatabaseError> {
        let current = self.get(id).await?;
        Ok(match current {
            None => DatabaseError::NotFound { id },
            Some(task) => match update.expected_version {
                Some(expected) if expected != task.version => DatabaseError::Conflict {
                    id,
                    reason: format!("expected version {expected}, found {}", task.version),
                },
                _ => DatabaseError::Conflict {
                    id,
                    reason: format!("cannot move from {} to {}", task.status, update.status),
                },
            },
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, text, status, user_id, created_at, started_at, ended_at, version, attempts";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let text: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.text: {e}")))?;

    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("task {id}: {e}")))?;

    let user_id: String = row.get(3).unwrap_or_default();

    let created_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("task.created_at: {e}")))?;

    let started_str: Option<String> = row.get(5).ok();
    let ended_str: Option<String> = row.get(6).ok();

    let version: i64 = row.get(7).unwrap_or(0);
    let attempts: i64 = row.get(8).unwrap_or(0);

    Ok(Task {
        id,
        text,
        status,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(started_str),
        ended_at: parse_optional_datetime(ended_str),
        user_id,
        version,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
    })
}

/// SQL list of quoted status literals, e.g. `'pending', 'processing'`.
fn status_list(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn create(&self, new: NewTask) -> Result<Task, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut tasks = self
            .query_tasks(
                "create",
                &format!(
                    "INSERT INTO tasks (text, status, user_id, created_at) VALUES (?1, ?2, ?3, ?4) RETURNING {TASK_COLUMNS}"
                ),
                params![
                    new.text.as_str(),
                    TaskStatus::Pending.as_str(),
                    new.user_id.as_str(),
                    now
                ],
            )
            .await?;

        let task = tasks
            .pop()
            .ok_or_else(|| DatabaseError::Query("create: no row returned".to_string()))?;
        debug!(task_id = task.id, "Task created");
        Ok(task)
    }

    async fn get(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list",
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"),
            (),
        )
        .await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_by_status",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id"),
            params![status.as_str()],
        )
        .await
    }

    async fn update_text(&self, id: i64, text: &str) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET text = ?1 WHERE id = ?2",
                params![text, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_text: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::NotFound { id });
        }
        Ok(())
    }

    async fn update_status(&self, id: i64, update: StatusUpdate) -> Result<(), DatabaseError> {
        let attempts_inc: i64 = if update.status == TaskStatus::Processing { 1 } else { 0 };
        let sql = format!(
            "UPDATE tasks SET status = ?1, \
               started_at = COALESCE(?2, started_at), \
               ended_at = COALESCE(?3, ended_at), \
               attempts = attempts + ?4, \
               version = version + 1 \
             WHERE id = ?5 AND status IN ({}) AND (?6 IS NULL OR version = ?6)",
            status_list(update.status.predecessors())
        );

        let count = self
            .conn()
            .execute(
                &sql,
                params![
                    update.status.as_str(),
                    update.started_at.map(|d| d.to_rfc3339()),
                    update.ended_at.map(|d| d.to_rfc3339()),
                    attempts_inc,
                    id,
                    update.expected_version
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if count == 0 {
            return Err(self.diagnose_missed_update(id, &update).await?);
        }
        debug!(task_id = id, status = %update.status, "Task status updated");
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete: {e}")))?;
        Ok(count > 0)
    }
}
