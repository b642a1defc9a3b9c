//! `MemoryCache` — a TTL map with a periodic expiry sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::config::CacheConfig;

struct CacheEntry<V> {
    value: V,
    /// `None` means the entry never expires.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// String-keyed cache of cloneable values with per-entry TTL.
pub struct MemoryCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    stats: CacheStats,
    config: CacheConfig,
}

impl<V: Clone + Send + Sync + 'static> MemoryCache<V> {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
            config,
        })
    }

    /// Get a live value. An expired entry is dropped and counts as a miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.stats.hit();
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.stats.miss();
                    return None;
                }
            }
        }

        // Expired: re-check under the write lock, a writer may have refreshed it.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            self.stats.expired(1);
        }
        self.stats.miss();
        None
    }

    /// Insert with an explicit TTL. A zero TTL never expires.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.into(), CacheEntry { value, expires_at });
        self.stats.set();
    }

    /// Insert with the configured default TTL.
    pub async fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.config.default_ttl).await;
    }

    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            self.stats.deleted(1);
        }
        removed
    }

    /// Whether a live entry exists. Does not touch hit/miss counters.
    pub async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Remove every key containing `pattern`. Returns how many were removed.
    pub async fn invalidate_matching(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.contains(pattern));
        let removed = before - entries.len();
        self.stats.deleted(removed as u64);
        removed
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before - entries.len();
        if expired > 0 {
            self.stats.expired(expired as u64);
            debug!(count = expired, "Expired cache entries");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Spawn a background task that sweeps expired entries until cancelled.
pub fn spawn_sweeper<V: Clone + Send + Sync + 'static>(
    cache: Arc<MemoryCache<V>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = cache.config.cleanup_interval;
        if period.is_zero() {
            warn!("Cache sweeper disabled: cleanup interval is zero");
            return;
        }
        let mut interval = tokio::time::interval(period);
        // Skip immediate first tick
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    cache.sweep().await;
                }
                _ = cancel.cancelled() => {
                    debug!("Cache sweeper stopped");
                    return;
                }
            }
        }
    })
}
