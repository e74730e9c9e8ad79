//! Per-host ingestion cadence tracking.
//!
//! The tracker records when each host last delivered a report and how often
//! it has reported recently, and classifies hosts as healthy, stale or
//! over-active. It is fed by the ingestion service after successful
//! persistence and read by the monitoring endpoints; it never influences
//! whether an ingestion succeeds.
//!
//! All state lives behind one `std::sync::RwLock`. The lock is never held
//! across an `.await`.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::TrackingConfig;
use crate::models::HostId;

/// More than this many ingestions within the last hour marks a host over-active.
pub const MAX_INGESTIONS_PER_HOUR: usize = 2;

/// Two ingestions closer together than this trigger a warning.
pub const MIN_INGESTION_INTERVAL_MINS: i64 = 30;

/// Window used for the `active` count and the over-active rate.
const ACTIVE_WINDOW_MINS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    FirstTime,
    Healthy,
    Stale,
    OverActive,
}

/// Point-in-time view of one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub host_id: HostId,
    pub status: HostHealth,
    pub last_ingestion: Option<DateTime<Utc>>,
    pub time_since_last_secs: Option<i64>,
    pub ingestion_count: u64,
    /// History entries within the last hour.
    pub ingestions_last_hour: usize,
    /// History entries within the history window divided by its length in hours.
    pub rate_24h: f64,
    pub is_stale: bool,
    pub is_over_active: bool,
}

/// Fleet-wide aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSummary {
    pub total_hosts: usize,
    pub healthy_hosts: usize,
    pub stale_hosts: usize,
    pub over_active_hosts: usize,
    pub active_hosts: usize,
    pub average_rate_24h: f64,
    pub max_rate_24h: f64,
    pub health_percentage: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerState {
    last_ingestion: HashMap<HostId, DateTime<Utc>>,
    lifetime_count: HashMap<HostId, u64>,
    history: HashMap<HostId, Vec<DateTime<Utc>>>,
}

pub struct IngestionTracker {
    clock: SharedClock,
    alert_threshold: Duration,
    retention: Duration,
    history_window: Duration,
    state: RwLock<TrackerState>,
}

impl IngestionTracker {
    pub fn new(config: &TrackingConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            alert_threshold: config.alert_threshold(),
            retention: config.retention(),
            history_window: config.history_window(),
            state: RwLock::new(TrackerState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a successful ingestion for `host_id` at the current clock time.
    pub fn record(&self, host_id: HostId) {
        let now = self.clock.now();
        let cutoff = now - self.history_window;

        let (previous, history_len) = {
            let mut state = self.write();
            let previous = state.last_ingestion.insert(host_id, now);
            *state.lifetime_count.entry(host_id).or_insert(0) += 1;

            let history = state.history.entry(host_id).or_default();
            history.retain(|ts| *ts >= cutoff);
            history.push(now);
            (previous, history.len())
        };

        if let Some(prev) = previous {
            let interval = now - prev;
            if interval < Duration::minutes(MIN_INGESTION_INTERVAL_MINS) && history_len > 1 {
                warn!(
                    host_id,
                    interval_secs = interval.num_seconds(),
                    ingestions_in_window = history_len,
                    "host is ingesting software more often than expected"
                );
            }
        }
    }

    /// Status of one host. Unknown hosts are reported as first-time.
    pub fn host_status(&self, host_id: HostId) -> HostStatus {
        let now = self.clock.now();
        let state = self.read();
        self.status_locked(&state, host_id, now)
    }

    fn status_locked(&self, state: &TrackerState, host_id: HostId, now: DateTime<Utc>) -> HostStatus {
        let Some(last) = state.last_ingestion.get(&host_id).copied() else {
            return HostStatus {
                host_id,
                status: HostHealth::FirstTime,
                last_ingestion: None,
                time_since_last_secs: None,
                ingestion_count: 0,
                ingestions_last_hour: 0,
                rate_24h: 0.0,
                is_stale: false,
                is_over_active: false,
            };
        };

        let history = state.history.get(&host_id).map(Vec::as_slice).unwrap_or(&[]);
        let hour_ago = now - Duration::minutes(ACTIVE_WINDOW_MINS);
        let window_start = now - self.history_window;
        let last_hour = history.iter().filter(|ts| **ts >= hour_ago).count();
        let in_window = history.iter().filter(|ts| **ts >= window_start).count();
        let window_hours = (self.history_window.num_seconds() as f64 / 3600.0).max(1.0);

        let since = now - last;
        let is_stale = since >= self.alert_threshold;
        let is_over_active = last_hour > MAX_INGESTIONS_PER_HOUR;
        let status = if is_stale {
            HostHealth::Stale
        } else if is_over_active {
            HostHealth::OverActive
        } else {
            HostHealth::Healthy
        };

        HostStatus {
            host_id,
            status,
            last_ingestion: Some(last),
            time_since_last_secs: Some(since.num_seconds()),
            ingestion_count: state.lifetime_count.get(&host_id).copied().unwrap_or(0),
            ingestions_last_hour: last_hour,
            rate_24h: in_window as f64 / window_hours,
            is_stale,
            is_over_active,
        }
    }

    fn all_statuses(&self) -> Vec<HostStatus> {
        let now = self.clock.now();
        let state = self.read();
        let mut statuses: Vec<HostStatus> = state
            .last_ingestion
            .keys()
            .map(|host_id| self.status_locked(&state, *host_id, now))
            .collect();
        statuses.sort_by_key(|s| s.host_id);
        statuses
    }

    pub fn stale_hosts(&self) -> Vec<HostStatus> {
        self.all_statuses()
            .into_iter()
            .filter(|s| s.status == HostHealth::Stale)
            .collect()
    }

    pub fn over_active_hosts(&self) -> Vec<HostStatus> {
        self.all_statuses()
            .into_iter()
            .filter(|s| s.status == HostHealth::OverActive)
            .collect()
    }

    pub fn summary(&self) -> TrackingSummary {
        let now = self.clock.now();
        let statuses = self.all_statuses();
        let active_cutoff = Duration::minutes(ACTIVE_WINDOW_MINS).num_seconds();

        let total = statuses.len();
        let count = |h: HostHealth| statuses.iter().filter(|s| s.status == h).count();
        let healthy = count(HostHealth::Healthy);
        let active = statuses
            .iter()
            .filter(|s| s.time_since_last_secs.is_some_and(|secs| secs <= active_cutoff))
            .count();
        let max_rate = statuses.iter().map(|s| s.rate_24h).fold(0.0, f64::max);
        let (average_rate, health_percentage) = if total > 0 {
            (
                statuses.iter().map(|s| s.rate_24h).sum::<f64>() / total as f64,
                healthy as f64 * 100.0 / total as f64,
            )
        } else {
            (0.0, 0.0)
        };

        TrackingSummary {
            total_hosts: total,
            healthy_hosts: healthy,
            stale_hosts: count(HostHealth::Stale),
            over_active_hosts: count(HostHealth::OverActive),
            active_hosts: active,
            average_rate_24h: average_rate,
            max_rate_24h: max_rate,
            health_percentage,
            timestamp: now,
        }
    }

    /// Forget hosts not seen within the retention period. Returns how many
    /// hosts were evicted.
    pub fn cleanup(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut state = self.write();
        let expired: Vec<HostId> = state
            .last_ingestion
            .iter()
            .filter(|(_, last)| **last < cutoff)
            .map(|(host_id, _)| *host_id)
            .collect();
        for host_id in &expired {
            state.last_ingestion.remove(host_id);
            state.lifetime_count.remove(host_id);
            state.history.remove(host_id);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "evicted hosts past tracker retention");
        }
        expired.len()
    }

    pub fn tracked_hosts(&self) -> usize {
        self.read().last_ingestion.len()
    }
}
