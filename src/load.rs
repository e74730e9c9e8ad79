//! Load-managed wrapper around the ingestion service.
//!
//! Every request passes, in order, a token bucket, a concurrency semaphore
//! and the circuit breaker before the service runs under the database
//! timeout. Each step honors the request's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::clock::SharedClock;
use crate::config::IngestionConfig;
use crate::error::IngestError;
use crate::metrics::{LoadMetrics, MetricsSnapshot};
use crate::models::{HostId, HostMetadata, IngestionRequest, ReportPayload};
use crate::rate_limit::TokenBucket;
use crate::service::{kind_label, IngestOutcome, IngestionService};

pub struct LoadManagedService {
    service: IngestionService,
    limiter: TokenBucket,
    semaphore: Semaphore,
    max_concurrent: usize,
    breaker: CircuitBreaker,
    metrics: Arc<LoadMetrics>,
    database_timeout: Duration,
}

impl LoadManagedService {
    pub fn new(service: IngestionService, config: &IngestionConfig, clock: SharedClock) -> Self {
        Self {
            service,
            limiter: TokenBucket::new(config.max_requests_per_second, config.burst_size, clock.clone()),
            semaphore: Semaphore::new(config.max_concurrent_hosts),
            max_concurrent: config.max_concurrent_hosts,
            breaker: CircuitBreaker::new(config.failure_threshold, config.recovery_timeout(), clock),
            metrics: Arc::new(LoadMetrics::new()),
            database_timeout: config.database_timeout(),
        }
    }

    pub fn service(&self) -> &IngestionService {
        &self.service
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Requests currently holding a concurrency slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Stop admitting requests. Waiters on the semaphore fail with
    /// [`IngestError::ShuttingDown`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub async fn handle_request(&self, request: &IngestionRequest) -> Result<IngestOutcome, IngestError> {
        self.handle(
            request.host_id,
            &request.host,
            &request.payload,
            &request.cancel,
            request.deadline,
        )
        .await
    }

    pub async fn handle(
        &self,
        host_id: HostId,
        host: &HostMetadata,
        payload: &ReportPayload,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<IngestOutcome, IngestError> {
        self.metrics.record_request();
        let started = Instant::now();

        let result = self.admit_and_run(host_id, host, payload, cancel, deadline).await;
        match &result {
            Ok(_) => self.metrics.record_success(started.elapsed()),
            Err(err) => {
                debug!(
                    host_id,
                    kind = kind_label(payload.kind()),
                    error = err.kind(),
                    "software ingestion rejected or failed"
                );
                self.metrics.record_error(err, started.elapsed());
            }
        }
        result
    }

    async fn admit_and_run(
        &self,
        host_id: HostId,
        host: &HostMetadata,
        payload: &ReportPayload,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<IngestOutcome, IngestError> {
        self.limiter.acquire(cancel, deadline).await?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            permit = self.semaphore.acquire() => permit.map_err(|_| IngestError::ShuttingDown)?,
        };
        self.metrics.enter();
        let _slot = InFlight(&self.metrics);

        self.breaker.try_acquire()?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            r = tokio::time::timeout(self.database_timeout, self.service.ingest(host_id, host, payload)) => {
                r.unwrap_or(Err(IngestError::Timeout(self.database_timeout)))
            }
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) if err.is_store_failure() => self.breaker.record_failure(),
            Err(_) => self.breaker.release(),
        }
        result
    }
}

/// Decrements the in-flight gauge on drop.
struct InFlight<'a>(&'a LoadMetrics);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{RawRow, Software};
    use crate::store::memory::InMemoryStore;

    fn config(rate: f64, burst: u32) -> IngestionConfig {
        IngestionConfig {
            max_requests_per_second: rate,
            burst_size: burst,
            ..IngestionConfig::default()
        }
    }

    fn rows() -> ReportPayload {
        let row: RawRow = [("name", "curl"), ("version", "8.0"), ("source", "deb_packages")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ReportPayload::Agent(vec![row])
    }

    #[tokio::test]
    async fn test_rate_limited_with_short_deadline() {
        let service = IngestionService::new(Arc::new(InMemoryStore::new()));
        let load = LoadManagedService::new(service, &config(1.0, 1), Arc::new(ManualClock::default()));
        let host = HostMetadata::new("ubuntu");
        let cancel = CancellationToken::new();
        let deadline = Some(Instant::now() + Duration::from_millis(100));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(load.handle(1, &host, &rows(), &cancel, deadline).await);
        }
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(IngestError::RateLimited)));
        assert!(matches!(outcomes[2], Err(IngestError::RateLimited)));

        let m = load.metrics();
        assert_eq!(m.total, 3);
        assert_eq!(m.success, 1);
        assert_eq!(m.rate_limited, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_admission() {
        let service = IngestionService::new(Arc::new(InMemoryStore::new()));
        let load = LoadManagedService::new(service, &config(50.0, 100), Arc::new(ManualClock::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = load
            .handle(1, &HostMetadata::new("darwin"), &ReportPayload::Mdm(Vec::<Software>::new()), &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert_eq!(load.metrics().cancelled, 1);
        assert_eq!(load.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_closed_semaphore_rejects() {
        let service = IngestionService::new(Arc::new(InMemoryStore::new()));
        let load = LoadManagedService::new(service, &config(50.0, 100), Arc::new(ManualClock::default()));
        load.close();
        let err = load
            .handle(1, &HostMetadata::new("ubuntu"), &rows(), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ShuttingDown));
        assert_eq!(load.in_flight(), 0);
    }
}
