//! Token bucket admission.
//!
//! Tokens refill continuously at `rate` per second up to `burst`. A caller
//! that finds the bucket empty reserves the next token and sleeps until it
//! is due, unless that instant lies past the caller's deadline, in which case
//! it is rejected straight away.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::error::IngestError;

struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

pub struct TokenBucket {
    rate: f64,
    burst: f64,
    clock: SharedClock,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate: f64, burst: u32, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            rate,
            burst: f64::from(burst),
            clock,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = (now - state.last_refill).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6;
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
            state.last_refill = now;
        }
    }

    /// Take a token if one is available now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket. Negative while waiters hold reservations.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Wait for a token.
    ///
    /// Returns [`IngestError::RateLimited`] without waiting when the token
    /// would arrive after `deadline`, and [`IngestError::Cancelled`] if
    /// `cancel` fires first. Either way the reservation is handed back.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let wait = {
            let mut state = self.lock();
            self.refill(&mut state);
            state.tokens -= 1.0;
            if state.tokens >= 0.0 {
                return Ok(());
            }
            let wait = Duration::from_secs_f64(-state.tokens / self.rate);
            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    state.tokens += 1.0;
                    return Err(IngestError::RateLimited);
                }
            }
            wait
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                self.lock().tokens += 1.0;
                Err(IngestError::Cancelled)
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
