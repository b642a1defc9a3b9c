//! In-memory TTL cache with background expiry and hit/miss statistics.

pub mod memory;
pub mod stats;

pub use memory::{MemoryCache, spawn_sweeper};
pub use stats::{CacheStats, CacheStatsSnapshot};
