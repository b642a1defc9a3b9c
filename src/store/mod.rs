//! Persistence layer — the `TaskStore` contract and its backends.

pub mod cached;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use cached::CachedTaskStore;
pub use libsql_backend::LibSqlTaskStore;
pub use memory::InMemoryTaskStore;
pub use traits::{TaskStore, with_timeout};
