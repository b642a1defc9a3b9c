//! Dispatch counters shared by the dispatcher and the worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug)]
pub struct DispatchStats {
    polls: AtomicU64,
    poll_errors: AtomicU64,
    enqueued: AtomicU64,
    claimed: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    reclaimed: AtomicU64,
    dead_lettered: AtomicU64,
    processing_micros: AtomicU64,
    processing_count: AtomicU64,
    started: Instant,
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            polls: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            processing_micros: AtomicU64::new(0),
            processing_count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub polls: u64,
    pub poll_errors: u64,
    pub enqueued: u64,
    /// pending -> processing transitions made by workers.
    pub claimed: u64,
    pub completed: u64,
    /// Tasks a worker dropped after a failed transition.
    pub abandoned: u64,
    /// Stale processing tasks returned to pending.
    pub reclaimed: u64,
    /// Tasks moved to failed after exhausting their attempts, whether found
    /// stale in processing or still pending at poll time.
    pub dead_lettered: u64,
    /// Completed tasks with a recorded processing time.
    pub processing_count: u64,
    /// Sum of claim-to-completion times.
    pub processing_time_total: Duration,
    /// Time since the counters were created.
    pub uptime: Duration,
}

impl DispatchStatsSnapshot {
    /// Mean claim-to-completion time, zero before the first completion.
    pub fn avg_processing_time(&self) -> Duration {
        match u32::try_from(self.processing_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.processing_time_total / n,
            Err(_) => Duration::from_micros(
                (self.processing_time_total.as_micros() / u128::from(self.processing_count))
                    as u64,
            ),
        }
    }
}

impl DispatchStats {
    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claimed(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processing_micros.fetch_add(micros, Ordering::Relaxed);
        self.processing_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            processing_count: self.processing_count.load(Ordering::Relaxed),
            processing_time_total: Duration::from_micros(
                self.processing_micros.load(Ordering::Relaxed),
            ),
            uptime: self.uptime(),
        }
    }
}
