//! Circuit breaker guarding the store.
//!
//! ```text
//!   Closed ──failures ≥ threshold──▶ Open ──recovery elapsed──▶ HalfOpen
//!     ▲                                ▲                            │
//!     └────────────success─────────────┼────────────────────────────┤
//!                                      └───────────failure──────────┘
//! ```
//!
//! HalfOpen admits a single probe. Further requests are rejected until the
//! probe reports back.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: std::time::Duration, clock: SharedClock) -> Self {
        Self {
            failure_threshold,
            recovery_timeout: Duration::from_std(recovery_timeout).unwrap_or_else(|_| Duration::days(365)),
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to forward one request to the store.
    pub fn try_acquire(&self) -> Result<(), IngestError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = self.clock.now();
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now - opened_at;
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    let remaining = (self.recovery_timeout - elapsed)
                        .to_std()
                        .unwrap_or_default();
                    Err(IngestError::CircuitOpen {
                        retry_after: remaining,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(IngestError::CircuitOpen {
                        retry_after: self.recovery_timeout.to_std().unwrap_or_default(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(from = inner.state.as_str(), "circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.failures >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                warn!(failures = inner.failures, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                inner.probe_in_flight = false;
                warn!("circuit breaker probe failed, reopening");
            }
            _ => {}
        }
    }

    /// Give back an admission whose outcome says nothing about the store
    /// (the caller cancelled).
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn breaker() -> (ManualClock, CircuitBreaker) {
        let clock = ManualClock::default();
        let breaker = CircuitBreaker::new(3, std::time::Duration::from_secs(30), Arc::new(clock.clone()));
        (clock, breaker)
    }

    #[test]
    fn test_opens_at_threshold() {
        let (_clock, breaker) = breaker();
        for _ in 0..2 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        match breaker.try_acquire() {
            Err(IngestError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, std::time::Duration::from_secs(30));
            }
            other => panic!("expected circuit open, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_failures() {
        let (_clock, breaker) = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let (clock, breaker) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(Duration::seconds(30));

        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(
            breaker.try_acquire(),
            Err(IngestError::CircuitOpen { .. })
        ));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let (clock, breaker) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(Duration::seconds(31));
        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::seconds(10));
        assert!(breaker.try_acquire().is_err());
        clock.advance(Duration::seconds(20));
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_released_probe_lets_next_through() {
        let (clock, breaker) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(Duration::seconds(30));
        breaker.try_acquire().unwrap();
        breaker.release();
        assert!(breaker.try_acquire().is_ok());
    }
}
