//! Periodic maintenance: orphan catalog cleanup and tracker retention.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::SoftwareStore;
use crate::tracker::IngestionTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orphans_removed: u64,
    pub hosts_evicted: usize,
}

/// Run one maintenance pass.
pub async fn sweep_once(
    store: &dyn SoftwareStore,
    tracker: Option<&IngestionTracker>,
) -> Result<SweepReport> {
    let orphans_removed = store.cleanup_orphan_software().await?;
    let hosts_evicted = tracker.map(IngestionTracker::cleanup).unwrap_or(0);
    Ok(SweepReport {
        orphans_removed,
        hosts_evicted,
    })
}

/// Spawn a task that sweeps every `interval` until `cancel` fires. The first
/// pass runs one interval after start.
pub fn spawn_sweeper(
    store: Arc<dyn SoftwareStore>,
    tracker: Option<Arc<IngestionTracker>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep_once(store.as_ref(), tracker.as_deref()).await {
                        Ok(report) if report.orphans_removed > 0 || report.hosts_evicted > 0 => {
                            info!(
                                orphans_removed = report.orphans_removed,
                                hosts_evicted = report.hosts_evicted,
                                "maintenance sweep finished"
                            );
                        }
                        Ok(_) => debug!("maintenance sweep found nothing to do"),
                        Err(err) => warn!(error = %format!("{err:#}"), "maintenance sweep failed"),
                    }
                }
            }
        }
        debug!("maintenance sweeper stopped");
    })
}
