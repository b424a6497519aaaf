//! Per-camera circuit breaker guarding transcode launch attempts.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics::BREAKER_OPENED_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Counts consecutive transcode failures for one camera. After
/// `max_failures` the breaker opens and refuses attempts until
/// `reset_after` has elapsed, when a single probe attempt is allowed.
#[derive(Debug)]
pub struct CircuitBreaker {
    camera_id: String,
    max_failures: u32,
    reset_after: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self::with_limits(camera_id, 10, Duration::from_secs(60))
    }

    pub fn with_limits(
        camera_id: impl Into<String>,
        max_failures: u32,
        reset_after: Duration,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            max_failures,
            reset_after,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a launch attempt is currently allowed. Transitions
    /// Open -> HalfOpen once the reset window has elapsed.
    pub fn can_attempt(&self) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_after {
                    info!(camera_id = %self.camera_id, "circuit breaker half-open, allowing probe");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if inner.state != BreakerState::Closed || inner.failures > 0 {
            info!(camera_id = %self.camera_id, "circuit breaker reset to closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner.failures += 1;
        // A failed half-open probe reopens immediately.
        if inner.state == BreakerState::HalfOpen || inner.failures >= self.max_failures {
            if inner.state != BreakerState::Open {
                warn!(
                    camera_id = %self.camera_id,
                    failures = inner.failures,
                    "circuit breaker opened"
                );
                BREAKER_OPENED_TOTAL.inc();
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn failure_count(&self) -> u32 {
        match self.inner.lock() {
            Ok(g) => g.failures,
            Err(p) => p.into_inner().failures,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock() {
            Ok(g) => g.state,
            Err(p) => p.into_inner().state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let b = CircuitBreaker::with_limits("cam-1", 3, Duration::from_secs(60));
        assert!(b.can_attempt());
        b.record_failure();
        b.record_failure();
        assert!(b.can_attempt());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_attempt());
    }

    #[test]
    fn half_open_after_reset_window_then_closes_on_success() {
        let b = CircuitBreaker::with_limits("cam-2", 1, Duration::from_millis(0));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Zero reset window: the next check must allow a probe.
        assert!(b.can_attempt());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn failed_probe_reopens() {
        let b = CircuitBreaker::with_limits("cam-3", 5, Duration::from_millis(0));
        b.record_failure();
        b.record_failure();
        b.record_failure();
        b.record_failure();
        b.record_failure();
        assert!(b.can_attempt()); // half-open probe
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }
}
