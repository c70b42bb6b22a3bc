//! Per-cluster circuit breaker.
//!
//! Counts consecutive real failures; resyncs after "resource version too
//! old" are expected protocol behaviour and must not be recorded here.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Failures before the circuit opens
const OPEN_THRESHOLD: u32 = 5;
/// How long an open circuit stays open
const OPEN_FOR: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Thread-safe breaker shared between the watcher and read/write paths.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful round trip; closes the circuit.
    pub fn on_success(&self) {
        let mut g = self.inner.lock().unwrap();
        g.consecutive_failures = 0;
        g.opened_at = None;
    }

    /// Record a real failure. Returns true when this failure opened the
    /// circuit.
    pub fn on_failure(&self) -> bool {
        self.on_failure_at(Instant::now())
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    fn on_failure_at(&self, now: Instant) -> bool {
        let mut g = self.inner.lock().unwrap();
        g.consecutive_failures += 1;
        if g.consecutive_failures >= OPEN_THRESHOLD && g.opened_at.is_none() {
            g.opened_at = Some(now);
            return true;
        }
        false
    }

    fn state_at(&self, now: Instant) -> BreakerState {
        let mut g = self.inner.lock().unwrap();
        match g.opened_at {
            Some(t) if now.duration_since(t) < OPEN_FOR => BreakerState::Open,
            Some(_) => {
                // half-open: allow traffic again, keep the count so one more
                // failure re-opens immediately
                g.opened_at = None;
                g.consecutive_failures = OPEN_THRESHOLD - 1;
                BreakerState::Closed
            }
            None => BreakerState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_five_consecutive_failures() {
        let b = CircuitBreaker::new();
        let t0 = Instant::now();
        for _ in 0..4 {
            assert!(!b.on_failure_at(t0));
        }
        assert_eq!(b.state_at(t0), BreakerState::Closed);
        assert!(b.on_failure_at(t0));
        assert_eq!(b.state_at(t0), BreakerState::Open);
    }

    #[test]
    fn success_resets_the_count() {
        let b = CircuitBreaker::new();
        let t0 = Instant::now();
        for _ in 0..4 {
            b.on_failure_at(t0);
        }
        b.on_success();
        assert!(!b.on_failure_at(t0));
        assert_eq!(b.state_at(t0), BreakerState::Closed);
    }

    #[test]
    fn reopens_quickly_after_half_open_failure() {
        let b = CircuitBreaker::new();
        let t0 = Instant::now();
        for _ in 0..5 {
            b.on_failure_at(t0);
        }
        let later = t0 + Duration::from_secs(61);
        assert_eq!(b.state_at(later), BreakerState::Closed);
        // one failure in half-open trips it again
        assert!(b.on_failure_at(later));
        assert_eq!(b.state_at(later), BreakerState::Open);
    }
}
