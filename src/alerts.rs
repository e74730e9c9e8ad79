//! Alerts derived from a [`TrackingSummary`].

use serde::Serialize;

use crate::tracker::TrackingSummary;

pub const STALE_CRITICAL_PCT: f64 = 25.0;
pub const STALE_WARNING_PCT: f64 = 10.0;
pub const OVER_ACTIVE_WARNING_PCT: f64 = 5.0;
pub const ACTIVE_INFO_PCT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    /// `stale_hosts`, `over_active_hosts` or `low_activity`.
    pub kind: &'static str,
    pub message: String,
    /// Observed share of hosts, in percent.
    pub value: f64,
    pub threshold: f64,
}

fn pct(part: usize, total: usize) -> f64 {
    part as f64 * 100.0 / total as f64
}

/// Derive alerts from a summary. An empty fleet raises nothing.
pub fn derive_alerts(summary: &TrackingSummary) -> Vec<Alert> {
    let total = summary.total_hosts;
    if total == 0 {
        return Vec::new();
    }

    let mut alerts = Vec::new();

    let stale = pct(summary.stale_hosts, total);
    if stale > STALE_CRITICAL_PCT {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            kind: "stale_hosts",
            message: format!(
                "{} of {} hosts ({:.1}%) have not reported software recently",
                summary.stale_hosts, total, stale
            ),
            value: stale,
            threshold: STALE_CRITICAL_PCT,
        });
    } else if stale > STALE_WARNING_PCT {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            kind: "stale_hosts",
            message: format!(
                "{} of {} hosts ({:.1}%) have not reported software recently",
                summary.stale_hosts, total, stale
            ),
            value: stale,
            threshold: STALE_WARNING_PCT,
        });
    }

    let over_active = pct(summary.over_active_hosts, total);
    if over_active > OVER_ACTIVE_WARNING_PCT {
        alerts.push(Alert {
            level: AlertLevel::Warning,
            kind: "over_active_hosts",
            message: format!(
                "{} of {} hosts ({:.1}%) report software more than {} times per hour",
                summary.over_active_hosts,
                total,
                over_active,
                crate::tracker::MAX_INGESTIONS_PER_HOUR
            ),
            value: over_active,
            threshold: OVER_ACTIVE_WARNING_PCT,
        });
    }

    let active = pct(summary.active_hosts, total);
    if active < ACTIVE_INFO_PCT {
        alerts.push(Alert {
            level: AlertLevel::Info,
            kind: "low_activity",
            message: format!(
                "only {} of {} hosts ({:.1}%) reported within the last hour",
                summary.active_hosts, total, active
            ),
            value: active,
            threshold: ACTIVE_INFO_PCT,
        });
    }

    alerts
}
