//! Error types for the dispatch subsystem.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// The backing database could not be opened or reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Task {id} not found")]
    NotFound { id: i64 },

    /// Version mismatch or disallowed status transition.
    #[error("Update conflict on task {id}: {reason}")]
    Conflict { id: i64, reason: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout { .. } | Self::Query(_)
        )
    }
}

/// Task queue errors. A full queue is not an error: `add` waits instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Enqueue of task {id} cancelled")]
    Cancelled { id: i64 },
}

/// Runtime lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{remaining} background loop(s) still running after {grace:?}; aborted")]
    ShutdownTimeout { remaining: usize, grace: Duration },

    #[error("Background loop panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
