//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::worker::queue::DEFAULT_QUEUE_CAPACITY;

/// Environment variable prefix for every dispatch setting.
const ENV_PREFIX: &str = "TASK_DISPATCH_";

/// Dispatcher and worker pool configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often the dispatcher polls the store for pending tasks.
    pub poll_interval: Duration,
    /// Upper bound on the dispatcher's pending-task query.
    pub query_timeout: Duration,
    /// Upper bound on each worker store call.
    pub store_timeout: Duration,
    /// Capacity of the bounded task channel.
    pub queue_capacity: usize,
    /// Number of workers in the pool.
    pub workers: usize,
    /// Lower bound of the simulated work duration.
    pub work_min: Duration,
    /// Upper bound of the simulated work duration.
    pub work_max: Duration,
    /// A `processing` task whose `started_at` is older than this is reclaimed.
    pub stale_after: Duration,
    /// Claims allowed before a reclaimed task is dead-lettered as `failed`.
    pub max_attempts: u32,
    /// Extra attempts for a transient store error during a transition.
    pub update_retries: u32,
    /// Initial backoff between transition retries (doubles each retry).
    pub retry_backoff: Duration,
    /// Reclaim every orphaned `processing` task on the first tick.
    ///
    /// Assumes this process is the only dispatcher on the store: anything in
    /// `processing` at startup is treated as orphaned, including tasks another
    /// live process is still working on. Deployments sharing a store across
    /// processes set `TASK_DISPATCH_RECLAIM_ON_START=false` and rely on
    /// `stale_after` alone.
    pub reclaim_on_start: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: 4,
            work_min: Duration::from_secs(1),
            work_max: Duration::from_secs(3),
            stale_after: Duration::from_secs(300), // 5 minutes
            max_attempts: 3,
            update_retries: 2,
            retry_backoff: Duration::from_millis(200),
            reclaim_on_start: true,
        }
    }
}

impl DispatchConfig {
    /// Build from `TASK_DISPATCH_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            poll_interval: millis(&lookup, "POLL_INTERVAL_MS", defaults.poll_interval)?,
            query_timeout: millis(&lookup, "QUERY_TIMEOUT_MS", defaults.query_timeout)?,
            store_timeout: millis(&lookup, "STORE_TIMEOUT_MS", defaults.store_timeout)?,
            queue_capacity: parsed(&lookup, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            workers: parsed(&lookup, "WORKERS", defaults.workers)?,
            work_min: millis(&lookup, "WORK_MIN_MS", defaults.work_min)?,
            work_max: millis(&lookup, "WORK_MAX_MS", defaults.work_max)?,
            stale_after: parsed(&lookup, "STALE_AFTER_SECS", defaults.stale_after.as_secs())
                .map(Duration::from_secs)?,
            max_attempts: parsed(&lookup, "MAX_ATTEMPTS", defaults.max_attempts)?,
            update_retries: parsed(&lookup, "UPDATE_RETRIES", defaults.update_retries)?,
            retry_backoff: millis(&lookup, "RETRY_BACKOFF_MS", defaults.retry_backoff)?,
            reclaim_on_start: parsed(&lookup, "RECLAIM_ON_START", defaults.reclaim_on_start)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatch loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("WORKERS", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("QUEUE_CAPACITY", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("POLL_INTERVAL_MS", "must be greater than 0"));
        }
        if self.work_min > self.work_max {
            return Err(invalid(
                "WORK_MIN_MS",
                format!("{:?} exceeds WORK_MAX_MS {:?}", self.work_min, self.work_max),
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        Ok(())
    }
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when a caller does not pick one.
    pub default_ttl: Duration,
    /// How often expired entries are swept.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Reject settings the sweeper cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup_interval.is_zero() {
            return Err(invalid("CACHE_CLEANUP_INTERVAL", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Number of demo tasks to create at startup (`TASK_DISPATCH_SEED_TASKS`).
pub fn seed_tasks_from_env() -> Result<usize, ConfigError> {
    seed_tasks_from_lookup(|key| std::env::var(key).ok())
}

pub fn seed_tasks_from_lookup<F>(lookup: F) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(&lookup, "SEED_TASKS", 0)
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        message: message.into(),
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(&format!("{ENV_PREFIX}{key}")) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parsed(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = DispatchConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.workers, 4);
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert!(config.reclaim_on_start);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = DispatchConfig::from_lookup(lookup_from(&[
            ("POLL_INTERVAL_MS", "250"),
            ("WORKERS", "3"),
            ("STALE_AFTER_SECS", "30"),
            ("RECLAIM_ON_START", "false"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.workers, 3);
        assert_eq!(config.stale_after, Duration::from_secs(30));
        assert!(!config.reclaim_on_start);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = DispatchConfig::from_lookup(lookup_from(&[("WORKERS", "many")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "TASK_DISPATCH_WORKERS"),
        }
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(DispatchConfig::from_lookup(lookup_from(&[("WORKERS", "0")])).is_err());
    }

    #[test]
    fn seed_count_is_parsed() {
        assert_eq!(seed_tasks_from_lookup(|_| None).unwrap(), 0);
        assert_eq!(
            seed_tasks_from_lookup(lookup_from(&[("SEED_TASKS", " 12 ")])).unwrap(),
            12
        );
    }

    #[test]
    fn bad_seed_count_is_an_error() {
        let err = seed_tasks_from_lookup(lookup_from(&[("SEED_TASKS", "lots")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => {
                assert_eq!(key, "TASK_DISPATCH_SEED_TASKS")
            }
        }
        assert!(seed_tasks_from_lookup(lookup_from(&[("SEED_TASKS", "-1")])).is_err());
    }

    #[test]
    fn zero_cleanup_interval_rejected() {
        let config = CacheConfig {
            cleanup_interval: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_work_range_rejected() {
        let config = DispatchConfig {
            work_min: Duration::from_secs(5),
            work_max: Duration::from_secs(1),
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
