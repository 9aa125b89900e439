//! Circuit breaker guarding the persistence store.
//!
//! ```text
//!  CLOSED ──(threshold consecutive failures)──► OPEN
//!    ▲                                           │ (open timeout elapsed)
//!    │                                           ▼
//!    └───────────(probe succeeds)────────── HALF_OPEN ──(probe fails)──► OPEN
//! ```
//!
//! Transitions depend only on elapsed time and call outcomes; nothing is persisted.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use rally_core::RallyError;
use std::time::{Duration, Instant};

/// Breaker position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric value for the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask permission for one call at `now`.
    ///
    /// Fails fast with `CircuitOpen` while open. Once the timeout has elapsed
    /// a single probe is let through; concurrent callers keep failing fast
    /// until the probe reports back.
    pub fn acquire(&self, now: Instant) -> Result<(), RallyError> {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!("Persistence circuit half-open, sending probe");
                    Ok(())
                } else {
                    Err(RallyError::CircuitOpen {
                        retry_in_ms: (self.open_timeout - elapsed).as_millis() as u64,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(RallyError::CircuitOpen { retry_in_ms: 0 })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// A permitted call succeeded
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!("Persistence circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// A permitted call failed at `now`
    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);
        inner.probe_in_flight = false;

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failure_count >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            tracing::warn!(
                failures = inner.failure_count,
                open_for_ms = self.open_timeout.as_millis() as u64,
                "Persistence circuit opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.inner.lock().last_failure_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&BreakerConfig {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker();
        let t0 = Instant::now();

        for _ in 0..4 {
            assert!(cb.acquire(t0).is_ok());
            cb.record_failure(t0);
        }
        assert_eq!(cb.state(), BreakerState::Closed);

        assert!(cb.acquire(t0).is_ok());
        cb.record_failure(t0);
        assert_eq!(cb.state(), BreakerState::Open);

        match cb.acquire(t0 + Duration::from_secs(10)) {
            Err(RallyError::CircuitOpen { retry_in_ms }) => assert_eq!(retry_in_ms, 50_000),
            other => panic!("expected fast failure, got {:?}", other),
        }
    }

    #[test]
    fn test_success_resets_count() {
        let cb = breaker();
        let t0 = Instant::now();
        for _ in 0..4 {
            cb.record_failure(t0);
        }
        cb.record_success();
        cb.record_failure(t0);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_half_open_single_probe() {
        let cb = breaker();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure(t0);
        }

        let later = t0 + Duration::from_secs(60);
        assert!(cb.acquire(later).is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        // Second caller while the probe is running
        assert!(cb.acquire(later).is_err());

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.acquire(later).is_ok());
    }

    #[test]
    fn test_failed_probe_restarts_timer() {
        let cb = breaker();
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure(t0);
        }

        let probe_at = t0 + Duration::from_secs(61);
        assert!(cb.acquire(probe_at).is_ok());
        cb.record_failure(probe_at);
        assert_eq!(cb.state(), BreakerState::Open);

        assert!(cb.acquire(probe_at + Duration::from_secs(30)).is_err());
        assert!(cb.acquire(probe_at + Duration::from_secs(60)).is_ok());
    }
}
