//! Ingestion service.
//!
//! Turns one host report into a store mutation: normalize the report, replace
//! the host's software set and installed-path set as one unit, then record
//! the ingestion with the tracker. Agent and MDM reports take the same path once
//! normalized.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::IngestError;
use crate::models::{HostId, HostMetadata, IngestionKind, RawRow, ReportPayload, Software};
use crate::normalize::{normalize_mdm_software, parse_agent_rows, ParsedReport};
use crate::store::SoftwareStore;
use crate::tracker::IngestionTracker;

/// Counts describing what one ingestion did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Software entries left after normalization.
    pub software: usize,
    pub installed_paths: usize,
    /// Rows skipped as malformed or filtered.
    pub dropped: usize,
    pub inserted: usize,
    pub deleted: usize,
}

#[derive(Clone)]
pub struct IngestionService {
    store: Arc<dyn SoftwareStore>,
    tracker: Option<Arc<IngestionTracker>>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn SoftwareStore>) -> Self {
        Self {
            store,
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<IngestionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn store(&self) -> &Arc<dyn SoftwareStore> {
        &self.store
    }

    pub fn tracker(&self) -> Option<&Arc<IngestionTracker>> {
        self.tracker.as_ref()
    }

    pub async fn ingest_agent_report(
        &self,
        host_id: HostId,
        host: &HostMetadata,
        rows: &[RawRow],
    ) -> Result<IngestOutcome, IngestError> {
        let parsed = parse_agent_rows(host_id, host, rows);
        self.persist(host_id, parsed)
            .await
            .map_err(|e| e.context("ingest agent report"))
    }

    pub async fn ingest_mdm_report(
        &self,
        host_id: HostId,
        host: &HostMetadata,
        software: &[Software],
    ) -> Result<IngestOutcome, IngestError> {
        let parsed = normalize_mdm_software(host_id, host, software);
        self.persist(host_id, parsed)
            .await
            .map_err(|e| e.context("ingest mdm report"))
    }

    /// Ingest whichever kind of report `payload` holds.
    pub async fn ingest(
        &self,
        host_id: HostId,
        host: &HostMetadata,
        payload: &ReportPayload,
    ) -> Result<IngestOutcome, IngestError> {
        match payload {
            ReportPayload::Agent(rows) => self.ingest_agent_report(host_id, host, rows).await,
            ReportPayload::Mdm(software) => self.ingest_mdm_report(host_id, host, software).await,
        }
    }

    async fn persist(&self, host_id: HostId, parsed: ParsedReport) -> Result<IngestOutcome, IngestError> {
        let mutation = self
            .store
            .replace_host_report(host_id, &parsed.software, &parsed.installed_paths)
            .await
            .map_err(|e| IngestError::persistence("replace host report", e))?;

        if let Some(tracker) = &self.tracker {
            tracker.record(host_id);
        }

        let outcome = IngestOutcome {
            software: parsed.software.len(),
            installed_paths: parsed.installed_paths.len(),
            dropped: parsed.dropped,
            inserted: mutation.inserted().len(),
            deleted: mutation.deleted().len(),
        };
        debug!(
            host_id,
            software = outcome.software,
            inserted = outcome.inserted,
            deleted = outcome.deleted,
            dropped = outcome.dropped,
            "host software ingested"
        );
        Ok(outcome)
    }
}

/// Label used in logs and metrics for a report kind.
pub fn kind_label(kind: IngestionKind) -> &'static str {
    match kind {
        IngestionKind::Agent => "agent",
        IngestionKind::Mdm => "mdm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TrackingConfig;
    use crate::error::PersistenceKind;
    use crate::store::memory::InMemoryStore;
    use crate::tracker::HostHealth;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_agent_report_persists_and_tracks() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = Arc::new(IngestionTracker::new(
            &TrackingConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let service = IngestionService::new(store.clone()).with_tracker(tracker.clone());

        let rows = vec![
            row(&[
                ("name", "Google Chrome"),
                ("version", "118.0.5993.117"),
                ("source", "apps"),
                ("bundle_identifier", "com.google.Chrome"),
                ("installed_path", "/Applications/Google Chrome.app"),
            ]),
            row(&[("name", "Visual Studio Code"), ("version", "1.84.2"), ("source", "apps")]),
            row(&[("version", "1.0"), ("source", "apps")]),
        ];
        let outcome = service
            .ingest_agent_report(1, &HostMetadata::new("darwin"), &rows)
            .await
            .unwrap();

        assert_eq!(outcome.software, 2);
        assert_eq!(outcome.installed_paths, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(store.list_host_installed_paths(1).await.unwrap().len(), 1);
        assert_eq!(tracker.host_status(1).status, HostHealth::Healthy);
    }

    #[tokio::test]
    async fn test_empty_report_succeeds() {
        let store = Arc::new(InMemoryStore::new());
        let service = IngestionService::new(store);

        let outcome = service
            .ingest_agent_report(1, &HostMetadata::new("linux"), &[])
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::default());
    }

    #[tokio::test]
    async fn test_store_error_wrapped_with_context() {
        use crate::error::StoreUnavailable;
        use crate::store::{MutationResult, SoftwareStore};
        use async_trait::async_trait;
        use std::collections::BTreeSet;

        struct Down;

        #[async_trait]
        impl SoftwareStore for Down {
            async fn replace_host_software(
                &self,
                _: HostId,
                _: &[Software],
            ) -> anyhow::Result<MutationResult> {
                Err(StoreUnavailable("connection refused".into()).into())
            }
            async fn replace_host_installed_paths(
                &self,
                _: HostId,
                _: &BTreeSet<String>,
                _: &MutationResult,
            ) -> anyhow::Result<()> {
                Err(StoreUnavailable("connection refused".into()).into())
            }
            async fn replace_host_report(
                &self,
                _: HostId,
                _: &[Software],
                _: &BTreeSet<String>,
            ) -> anyhow::Result<MutationResult> {
                Err(StoreUnavailable("connection refused".into()).into())
            }
            async fn cleanup_orphan_software(&self) -> anyhow::Result<u64> {
                Ok(0)
            }
            async fn list_host_software(&self, _: HostId) -> anyhow::Result<Vec<Software>> {
                Ok(Vec::new())
            }
            async fn list_host_installed_paths(
                &self,
                _: HostId,
            ) -> anyhow::Result<Vec<crate::models::InstalledPath>> {
                Ok(Vec::new())
            }
            async fn count_software(&self) -> anyhow::Result<i64> {
                Ok(0)
            }
        }

        let service = IngestionService::new(Arc::new(Down));
        let err = service
            .ingest_mdm_report(2, &HostMetadata::new("ios"), &[])
            .await
            .unwrap_err();
        match &err {
            IngestError::Persistence { context, kind, .. } => {
                assert_eq!(context, "ingest mdm report: replace host report");
                assert_eq!(*kind, PersistenceKind::Transient);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retriable());
    }
}
