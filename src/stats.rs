//! Counters for ring operations.
//!
//! All counters are atomic so concurrent callers can record without
//! contention. Use [`Ring::stats`](crate::Ring::stats) for a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every caller of a ring.
#[derive(Debug, Default)]
pub struct RingStats {
    /// Reads that found the key.
    hits: AtomicU64,
    /// Reads that did not find the key, including fail-soft misses.
    misses: AtomicU64,
    /// Writes acknowledged by a server.
    sets: AtomicU64,
    /// Deletes acknowledged by a server.
    deletes: AtomicU64,
    /// Failed attempts against individual servers.
    failures: AtomicU64,
    /// Candidates skipped because their breaker was open.
    suppressed: AtomicU64,
    /// Operations that exhausted every candidate.
    degraded: AtomicU64,
    /// Writes larger than the item size warning threshold.
    oversized: AtomicU64,
}

impl RingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit rate as a percentage (0.0 to 100.0); 0.0 before any read.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

/// A point-in-time copy of [`RingStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub failures: u64,
    pub suppressed: u64,
    pub degraded: u64,
    pub oversized: u64,
    pub hit_rate: f64,
}
