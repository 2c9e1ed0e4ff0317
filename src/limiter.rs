//! Per-server error limiting (circuit breaking).
//!
//! Each server owns one [`ErrorLimiter`]. Failures are counted inside a
//! window of `interval`; once `limit` failures land in the same window the
//! breaker opens and the server is skipped for `duration`. When that time
//! has passed the breaker closes again with a fresh window.
//!
//! ```text
//! Closed --(limit failures within interval)--> Open
//! Open   --(duration elapsed)----------------> Closed (window reset)
//! ```

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Server is usable.
    Closed,
    /// Server is skipped until the given instant.
    Open { until: Instant },
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open { .. } => write!(f, "open"),
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    failures: u32,
    window_start: Option<Instant>,
    suppressed_until: Option<Instant>,
}

impl WindowState {
    /// Close an expired breaker. Returns whether the server is usable.
    fn refresh(&mut self, now: Instant) -> bool {
        match self.suppressed_until {
            Some(until) if now < until => false,
            Some(_) => {
                *self = WindowState::default();
                true
            }
            None => true,
        }
    }
}

/// Sliding-window failure counter for one server.
#[derive(Debug)]
pub struct ErrorLimiter {
    limit: u32,
    interval: Duration,
    duration: Duration,
    state: Mutex<WindowState>,
}

impl ErrorLimiter {
    /// Create a limiter that opens after `limit` failures within `interval`
    /// and stays open for `duration`. A limit of zero opens on any failure.
    pub fn new(limit: u32, interval: Duration, duration: Duration) -> Self {
        Self {
            limit,
            interval,
            duration,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Whether the server should be skipped right now.
    pub fn is_suppressed(&self) -> bool {
        self.is_suppressed_at(Instant::now())
    }

    /// Whether the server should be skipped at `now`.
    /// This is useful for testing with a controlled clock.
    pub fn is_suppressed_at(&self, now: Instant) -> bool {
        !self.lock().refresh(now)
    }

    /// Current breaker state.
    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    /// Breaker state at `now`.
    pub fn state_at(&self, now: Instant) -> BreakerState {
        let mut state = self.lock();
        if state.refresh(now) {
            BreakerState::Closed
        } else {
            match state.suppressed_until {
                Some(until) => BreakerState::Open { until },
                None => BreakerState::Closed,
            }
        }
    }

    /// Record a failed operation. Returns `true` if this failure opened the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    /// Record a failed operation at `now`.
    pub fn record_failure_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if !state.refresh(now) {
            // already open; failures from calls that started before the
            // breaker opened do not extend it
            return false;
        }

        match state.window_start {
            Some(start) if now.duration_since(start) < self.interval => {}
            _ => {
                state.window_start = Some(now);
                state.failures = 0;
            }
        }
        state.failures += 1;

        if state.failures >= self.limit {
            state.suppressed_until = Some(now + self.duration);
            true
        } else {
            false
        }
    }

    /// Number of failures in the current window.
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        // The state is plain counters, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
