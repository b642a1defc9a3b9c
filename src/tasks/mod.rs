//! Task records and their lifecycle.

pub mod model;

pub use model::{NewTask, StatusUpdate, Task, TaskStatus, TaskStatusEvent};
