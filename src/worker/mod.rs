//! Dispatch system — moves pending tasks through the worker pool.
//!
//! Core components:
//! - `queue` — bounded task channel plus a side map of tracked tasks
//! - `dispatcher` — polls the store for pending tasks, reclaims stale ones
//! - `worker` — claims, runs and completes tasks
//! - `runtime` — starts everything under one token, graceful shutdown
//! - `stats` — shared counters

pub mod dispatcher;
pub mod queue;
pub mod runtime;
pub mod stats;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherState};
pub use queue::{QueueEntry, TaskQueue, TaskReceiver};
pub use runtime::DispatchRuntime;
pub use stats::{DispatchStats, DispatchStatsSnapshot};
pub use worker::{Worker, WorkerDeps, spawn_workers};
