//! Task data model — records, lifecycle status, partial updates and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be discovered by the dispatcher.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Work finished.
    Completed,
    /// Dead-lettered after exhausting its claim attempts.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Processing -> Pending` is the staleness reclaim edge; no worker
    /// takes it.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }

    /// Statuses a task may be in right before moving to `self`.
    pub fn predecessors(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;

        match self {
            Pending => &[Processing],
            Processing => &[Pending],
            Completed => &[Processing],
            Failed => &[Pending, Processing],
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A single task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned identifier.
    pub id: i64,
    /// Free-form description.
    pub text: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When a worker began processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When a worker finished processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Owning principal; opaque to the dispatch core.
    pub user_id: String,
    /// Bumped by every status update.
    #[serde(default)]
    pub version: i64,
    /// Number of times a worker has claimed this task.
    #[serde(default)]
    pub attempts: u32,
}

/// Creation payload; the store assigns everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub text: String,
    pub user_id: String,
}

impl NewTask {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
        }
    }
}

/// Partial status update.
///
/// `None` timestamps leave the stored value untouched; they never clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// When set, the update only applies if the stored version matches.
    pub expected_version: Option<i64>,
}

impl StatusUpdate {
    /// Bare status change with no timestamps.
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            started_at: None,
            ended_at: None,
            expected_version: None,
        }
    }

    /// Claim: `processing`, stamping `started_at`.
    pub fn processing(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            ..Self::to(TaskStatus::Processing)
        }
    }

    /// Finish: `completed`, stamping `ended_at` and leaving `started_at` alone.
    pub fn completed(ended_at: DateTime<Utc>) -> Self {
        Self {
            ended_at: Some(ended_at),
            ..Self::to(TaskStatus::Completed)
        }
    }

    /// Builder: require the stored version to match.
    pub fn expecting(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Event type tag carried by every status event.
pub const TASK_STATUS_CHANGED: &str = "task_status_changed";

/// Notification emitted after a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: i64,
    pub text: String,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatusEvent {
    /// Event for `task` having just moved to `status`.
    pub fn new(task: &Task, status: TaskStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: TASK_STATUS_CHANGED.to_string(),
            task_id: task.id,
            text: task.text.clone(),
            status,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn predecessors_match_transition_table() {
        use TaskStatus::*;
        for target in [Pending, Processing, Completed, Failed] {
            for from in [Pending, Processing, Completed, Failed] {
                assert_eq!(
                    target.predecessors().contains(&from),
                    from.can_transition_to(target),
                    "{from} -> {target}"
                );
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn completed_update_leaves_started_at_unset() {
        let now = Utc::now();
        let update = StatusUpdate::completed(now).expecting(3);
        assert_eq!(update.status, TaskStatus::Completed);
        assert!(update.started_at.is_none());
        assert_eq!(update.ended_at, Some(now));
        assert_eq!(update.expected_version, Some(3));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let task = Task {
            id: 7,
            text: "write report".into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            user_id: "u1".into(),
            version: 0,
            attempts: 0,
        };
        let event = TaskStatusEvent::new(&task, TaskStatus::Processing, Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_status_changed");
        assert_eq!(json["task_id"], 7);
        assert_eq!(json["status"], "processing");
    }
}
