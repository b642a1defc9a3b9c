//! Task status notifications — fire-and-forget fan-out of transition events.
//!
//! Delivery is at most once and best effort. A notifier never blocks the
//! caller and never reports failure back into the status transition.

use tokio::sync::broadcast;
use tracing::trace;

use crate::tasks::model::TaskStatusEvent;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Receiver of status transition events.
pub trait Notifier: Send + Sync {
    /// Hand off an event for `user_id`. Must return promptly.
    fn notify(&self, user_id: &str, event: TaskStatusEvent);
}

/// Notifier that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _user_id: &str, _event: TaskStatusEvent) {}
}

/// An event addressed to its owning user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub user_id: String,
    pub event: TaskStatusEvent,
}

/// Broadcast fan-out: every subscriber sees every event and filters by user.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<UserEvent>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, user_id: &str, event: TaskStatusEvent) {
        // Ok if nobody is listening
        if self
            .tx
            .send(UserEvent {
                user_id: user_id.to_string(),
                event,
            })
            .is_err()
        {
            trace!(user_id, "Status event dropped, no subscribers");
        }
    }
}
