//! Counters and a latency histogram for the load-managed wrapper.
//!
//! Everything is a relaxed atomic; snapshots are not taken under a lock, so
//! counters read together may be off by the requests in flight.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::IngestError;

/// Upper bounds of the latency buckets, in milliseconds. A final unbounded
/// bucket catches the rest.
pub const LATENCY_BUCKETS_MS: &[u64] = &[5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

#[derive(Debug, Default)]
pub struct LoadMetrics {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    rate_limited: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    latency_count: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_buckets: [AtomicU64; 12],
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyBucket {
    /// `None` for the unbounded bucket.
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub rate_limited: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub latency_count: u64,
    pub latency_avg_ms: f64,
    pub latency_buckets: Vec<LatencyBucket>,
}

impl LoadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(latency);
    }

    /// Count a rejected or failed request under its error kind.
    pub fn record_error(&self, err: &IngestError, latency: Duration) {
        match err {
            IngestError::RateLimited => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            IngestError::CircuitOpen { .. } | IngestError::ShuttingDown | IngestError::QueueFull => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
            IngestError::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            IngestError::Timeout(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                self.failure.fetch_add(1, Ordering::Relaxed);
                self.observe_latency(latency);
            }
            IngestError::Persistence { .. } => {
                self.failure.fetch_add(1, Ordering::Relaxed);
                self.observe_latency(latency);
            }
        }
    }

    /// Mark a request as holding a concurrency slot.
    pub fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    pub fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn observe_latency(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|le| ms <= *le)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let sum_us = self.latency_sum_us.load(Ordering::Relaxed);
        let latency_buckets = self
            .latency_buckets
            .iter()
            .enumerate()
            .map(|(i, c)| LatencyBucket {
                le_ms: LATENCY_BUCKETS_MS.get(i).copied(),
                count: c.load(Ordering::Relaxed),
            })
            .collect();

        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            latency_count: count,
            latency_avg_ms: if count > 0 {
                sum_us as f64 / count as f64 / 1000.0
            } else {
                0.0
            },
            latency_buckets,
        }
    }
}
