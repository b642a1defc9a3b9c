//! Task Dispatch — polling dispatcher and worker pool over a task store.

pub mod cache;
pub mod config;
pub mod error;
pub mod notify;
pub mod store;
pub mod tasks;
pub mod worker;

pub use config::{CacheConfig, DispatchConfig};
pub use error::{Error, Result};
pub use notify::{BroadcastNotifier, NoopNotifier, Notifier};
pub use store::TaskStore;
pub use tasks::{NewTask, StatusUpdate, Task, TaskStatus, TaskStatusEvent};
pub use worker::{DispatchRuntime, TaskQueue};
