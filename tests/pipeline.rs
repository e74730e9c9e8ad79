use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use software_ingestion::breaker::CircuitState;
use software_ingestion::clock::{system_clock, ManualClock};
use software_ingestion::config::{Config, IngestionConfig, TrackingConfig};
use software_ingestion::error::{IngestError, PersistenceKind, StoreUnavailable};
use software_ingestion::load::LoadManagedService;
use software_ingestion::models::{
    HostId, HostMetadata, IngestionRequest, InstalledPath, RawRow, ReportPayload, Software,
};
use software_ingestion::processor::AsyncProcessor;
use software_ingestion::service::IngestionService;
use software_ingestion::sqlite_store::SqliteStore;
use software_ingestion::store::memory::InMemoryStore;
use software_ingestion::store::{MutationResult, SoftwareStore};
use software_ingestion::tracker::{HostHealth, IngestionTracker};
use software_ingestion::{db, migrate};

// ─── Helpers ────────────────────────────────────────────────────────

async fn sqlite_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let mut config = Config::default();
    config.db.path = tmp.path().join("software.sqlite");
    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool, chrono::Duration::seconds(1)))
}

fn tracker(clock: &ManualClock) -> Arc<IngestionTracker> {
    Arc::new(IngestionTracker::new(
        &TrackingConfig::default(),
        Arc::new(clock.clone()),
    ))
}

fn row(pairs: &[(&str, &str)]) -> RawRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn packages(n: usize) -> Vec<RawRow> {
    (0..n)
        .map(|i| {
            let name = format!("pkg-{i}");
            row(&[("name", &name), ("version", "1.0"), ("source", "deb_packages")])
        })
        .collect()
}

fn s1_rows() -> Vec<RawRow> {
    vec![
        row(&[
            ("name", "Google Chrome"),
            ("version", "118.0.5993.117"),
            ("source", "apps"),
            ("bundle_identifier", "com.google.Chrome"),
            ("installed_path", "/Applications/Google Chrome.app"),
        ]),
        row(&[
            ("name", "Visual Studio Code"),
            ("version", "1.84.2"),
            ("source", "apps"),
        ]),
    ]
}

fn names(software: &[Software]) -> Vec<String> {
    let mut names: Vec<String> = software.iter().map(|s| s.name.clone()).collect();
    names.sort();
    names
}

/// Store wrapper that fails on demand and can add latency.
struct TestStore {
    inner: InMemoryStore,
    failing: AtomicBool,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl TestStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            failing: AtomicBool::new(false),
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SoftwareStore for TestStore {
    async fn replace_host_software(
        &self,
        host_id: HostId,
        software: &[Software],
    ) -> anyhow::Result<MutationResult> {
        self.inner.replace_host_software(host_id, software).await
    }

    async fn replace_host_installed_paths(
        &self,
        host_id: HostId,
        reported: &BTreeSet<String>,
        mutation: &MutationResult,
    ) -> anyhow::Result<()> {
        self.inner
            .replace_host_installed_paths(host_id, reported, mutation)
            .await
    }

    async fn replace_host_report(
        &self,
        host_id: HostId,
        software: &[Software],
        reported: &BTreeSet<String>,
    ) -> anyhow::Result<MutationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreUnavailable("database is unreachable".into()).into());
        }
        self.inner.replace_host_report(host_id, software, reported).await
    }

    async fn cleanup_orphan_software(&self) -> anyhow::Result<u64> {
        self.inner.cleanup_orphan_software().await
    }

    async fn list_host_software(&self, host_id: HostId) -> anyhow::Result<Vec<Software>> {
        self.inner.list_host_software(host_id).await
    }

    async fn list_host_installed_paths(
        &self,
        host_id: HostId,
    ) -> anyhow::Result<Vec<InstalledPath>> {
        self.inner.list_host_installed_paths(host_id).await
    }

    async fn count_software(&self) -> anyhow::Result<i64> {
        self.inner.count_software().await
    }
}

/// SQLite store whose installed-path work takes longer than the database
/// timeout.
struct SlowPathStore {
    inner: Arc<SqliteStore>,
    delay: Duration,
}

#[async_trait]
impl SoftwareStore for SlowPathStore {
    async fn replace_host_software(
        &self,
        host_id: HostId,
        software: &[Software],
    ) -> anyhow::Result<MutationResult> {
        self.inner.replace_host_software(host_id, software).await
    }

    async fn replace_host_installed_paths(
        &self,
        host_id: HostId,
        reported: &BTreeSet<String>,
        mutation: &MutationResult,
    ) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .replace_host_installed_paths(host_id, reported, mutation)
            .await
    }

    async fn replace_host_report(
        &self,
        host_id: HostId,
        software: &[Software],
        reported: &BTreeSet<String>,
    ) -> anyhow::Result<MutationResult> {
        tokio::time::sleep(self.delay).await;
        self.inner.replace_host_report(host_id, software, reported).await
    }

    async fn cleanup_orphan_software(&self) -> anyhow::Result<u64> {
        self.inner.cleanup_orphan_software().await
    }

    async fn list_host_software(&self, host_id: HostId) -> anyhow::Result<Vec<Software>> {
        self.inner.list_host_software(host_id).await
    }

    async fn list_host_installed_paths(
        &self,
        host_id: HostId,
    ) -> anyhow::Result<Vec<InstalledPath>> {
        self.inner.list_host_installed_paths(host_id).await
    }

    async fn count_software(&self) -> anyhow::Result<i64> {
        self.inner.count_software().await
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_basic_agent_report() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let clock = ManualClock::default();
    let tracker = tracker(&clock);
    let service = IngestionService::new(store.clone()).with_tracker(tracker.clone());

    service
        .ingest_agent_report(1, &HostMetadata::new("darwin"), &s1_rows())
        .await
        .unwrap();

    assert_eq!(store.count_software().await.unwrap(), 2);
    let host_software = store.list_host_software(1).await.unwrap();
    assert_eq!(
        names(&host_software),
        vec!["Google Chrome", "Visual Studio Code"]
    );

    let paths = store.list_host_installed_paths(1).await.unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].installed_path, "/Applications/Google Chrome.app");
    let chrome = host_software
        .iter()
        .find(|s| s.name == "Google Chrome")
        .unwrap();
    assert_eq!(paths[0].software_id, chrome.id);

    let status = tracker.host_status(1);
    assert_eq!(status.ingestion_count, 1);
    assert_eq!(status.status, HostHealth::Healthy);
}

#[tokio::test]
async fn test_mdm_ios_report() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let service = IngestionService::new(store.clone());

    let software = vec![
        Software {
            name: "Evernote".into(),
            version: "10.98.0".into(),
            bundle_identifier: "com.evernote.iPhone.Evernote".into(),
            ..Default::default()
        },
        Software {
            name: "TestFlight".into(),
            version: "3.4.1".into(),
            bundle_identifier: "com.apple.TestFlight".into(),
            ..Default::default()
        },
    ];
    service
        .ingest_mdm_report(2, &HostMetadata::new("ios"), &software)
        .await
        .unwrap();

    let stored = store.list_host_software(2).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|s| s.source == "ios_apps"));
    let vendor = |name: &str| {
        stored
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.vendor.clone())
            .unwrap()
    };
    assert_eq!(vendor("TestFlight"), "apple");
    assert_eq!(vendor("Evernote"), "evernote");
    assert!(store.list_host_installed_paths(2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kernel_detection_persisted() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let service = IngestionService::new(store.clone());

    let rows = vec![row(&[
        ("name", "linux-image-6.8.0-45-generic"),
        ("version", "6.8.0-45.45"),
        ("source", "deb_packages"),
    ])];
    service
        .ingest_agent_report(3, &HostMetadata::new("linux"), &rows)
        .await
        .unwrap();

    let stored = store.list_host_software(3).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_kernel);
}

#[tokio::test]
async fn test_rate_limit_rejects_past_deadline() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let config = IngestionConfig {
        max_requests_per_second: 1.0,
        burst_size: 1,
        ..IngestionConfig::default()
    };
    let load = LoadManagedService::new(IngestionService::new(store), &config, system_clock());
    let host = HostMetadata::new("ubuntu");
    let cancel = CancellationToken::new();
    let deadline = Some(Instant::now() + Duration::from_millis(100));

    let mut results = Vec::new();
    for host_id in 1..=3 {
        let payload = ReportPayload::Agent(packages(2));
        results.push(load.handle(host_id, &host, &payload, &cancel, deadline).await);
    }

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(IngestError::RateLimited)));
    assert!(matches!(results[2], Err(IngestError::RateLimited)));

    let metrics = load.metrics();
    assert_eq!(metrics.total, 3);
    assert_eq!(metrics.rate_limited, 2);
}

#[tokio::test]
async fn test_rate_limit_waits_without_deadline() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let config = IngestionConfig {
        max_requests_per_second: 20.0,
        burst_size: 1,
        ..IngestionConfig::default()
    };
    let load = LoadManagedService::new(IngestionService::new(store), &config, system_clock());
    let host = HostMetadata::new("ubuntu");
    let cancel = CancellationToken::new();

    let started = std::time::Instant::now();
    for host_id in 1..=3 {
        let payload = ReportPayload::Agent(packages(1));
        load.handle(host_id, &host, &payload, &cancel, None)
            .await
            .unwrap();
    }
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(load.metrics().success, 3);
    assert_eq!(load.metrics().rate_limited, 0);
}

#[tokio::test]
async fn test_circuit_opens_and_recovers() {
    let store = Arc::new(TestStore::new(Duration::ZERO));
    store.failing.store(true, Ordering::SeqCst);
    let clock = ManualClock::default();
    let config = IngestionConfig {
        failure_threshold: 5,
        recovery_timeout_secs: 30,
        ..IngestionConfig::default()
    };
    let load = LoadManagedService::new(
        IngestionService::new(store.clone()),
        &config,
        Arc::new(clock.clone()),
    );
    let host = HostMetadata::new("ubuntu");
    let cancel = CancellationToken::new();
    let payload = ReportPayload::Agent(packages(1));

    for _ in 0..5 {
        let err = load
            .handle(1, &host, &payload, &cancel, None)
            .await
            .unwrap_err();
        match err {
            IngestError::Persistence { kind, .. } => assert_eq!(kind, PersistenceKind::Transient),
            other => panic!("expected persistence error, got {other:?}"),
        }
    }
    assert_eq!(load.circuit_state(), CircuitState::Open);

    let err = load
        .handle(1, &host, &payload, &cancel, None)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::CircuitOpen { .. }));
    assert_eq!(store.calls.load(Ordering::SeqCst), 5);

    store.failing.store(false, Ordering::SeqCst);
    clock.advance(chrono::Duration::seconds(30));
    load.handle(1, &host, &payload, &cancel, None).await.unwrap();
    assert_eq!(load.circuit_state(), CircuitState::Closed);
    assert_eq!(load.breaker().failure_count(), 0);
    assert_eq!(store.calls.load(Ordering::SeqCst), 6);

    let metrics = load.metrics();
    assert_eq!(metrics.failure, 5);
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.success, 1);
}

#[tokio::test]
async fn test_half_open_admits_single_probe() {
    let store = Arc::new(TestStore::new(Duration::from_millis(100)));
    store.failing.store(true, Ordering::SeqCst);
    let clock = ManualClock::default();
    let config = IngestionConfig {
        failure_threshold: 1,
        ..IngestionConfig::default()
    };
    let load = Arc::new(LoadManagedService::new(
        IngestionService::new(store.clone()),
        &config,
        Arc::new(clock.clone()),
    ));
    let host = HostMetadata::new("ubuntu");
    let cancel = CancellationToken::new();
    let payload = ReportPayload::Agent(packages(1));

    assert!(load.handle(1, &host, &payload, &cancel, None).await.is_err());
    assert_eq!(load.circuit_state(), CircuitState::Open);

    store.failing.store(false, Ordering::SeqCst);
    clock.advance(chrono::Duration::seconds(30));

    let probe = {
        let load = load.clone();
        let host = host.clone();
        let payload = payload.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { load.handle(1, &host, &payload, &cancel, None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = load.handle(2, &host, &payload, &cancel, None).await;
    assert!(matches!(second, Err(IngestError::CircuitOpen { .. })));

    probe.await.unwrap().unwrap();
    assert_eq!(load.circuit_state(), CircuitState::Closed);
    assert_eq!(store.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_database_timeout_counts_as_failure() {
    let store = Arc::new(TestStore::new(Duration::from_millis(1_500)));
    let config = IngestionConfig {
        failure_threshold: 1,
        database_timeout_secs: 1,
        ..IngestionConfig::default()
    };
    let load = LoadManagedService::new(
        IngestionService::new(store),
        &config,
        Arc::new(ManualClock::default()),
    );
    let err = load
        .handle(
            1,
            &HostMetadata::new("ubuntu"),
            &ReportPayload::Agent(packages(1)),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Timeout(_)));
    assert_eq!(load.circuit_state(), CircuitState::Open);
    assert_eq!(load.metrics().timed_out, 1);
}

#[tokio::test]
async fn test_timeout_during_path_step_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let sqlite = sqlite_store(&tmp).await;
    IngestionService::new(sqlite.clone())
        .ingest_agent_report(1, &HostMetadata::new("darwin"), &s1_rows())
        .await
        .unwrap();
    let software_before = sqlite.list_host_software(1).await.unwrap();
    let paths_before = sqlite.list_host_installed_paths(1).await.unwrap();

    let store = Arc::new(SlowPathStore {
        inner: sqlite.clone(),
        delay: Duration::from_millis(1_500),
    });
    let config = IngestionConfig {
        database_timeout_secs: 1,
        ..IngestionConfig::default()
    };
    let load = LoadManagedService::new(
        IngestionService::new(store),
        &config,
        Arc::new(ManualClock::default()),
    );
    let next = vec![row(&[
        ("name", "Slack"),
        ("version", "4.35"),
        ("source", "apps"),
        ("installed_path", "/Applications/Slack.app"),
    ])];
    let err = load
        .handle(
            1,
            &HostMetadata::new("darwin"),
            &ReportPayload::Agent(next),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Timeout(_)));

    assert_eq!(sqlite.list_host_software(1).await.unwrap(), software_before);
    assert_eq!(sqlite.list_host_installed_paths(1).await.unwrap(), paths_before);
    assert_eq!(sqlite.count_software().await.unwrap(), 2);
}

#[tokio::test]
async fn test_tracker_classification() {
    let clock = ManualClock::default();
    let tracker = tracker(&clock);

    tracker.record(4);
    clock.advance(chrono::Duration::minutes(100));
    let status = tracker.host_status(4);
    assert_eq!(status.status, HostHealth::Stale);
    assert_eq!(status.time_since_last_secs, Some(100 * 60));

    tracker.record(4);
    clock.advance(chrono::Duration::minutes(10));
    tracker.record(4);
    let status = tracker.host_status(4);
    assert_eq!(status.status, HostHealth::Healthy);
    assert!(!status.is_over_active);
    assert!(tracker.over_active_hosts().is_empty());
}

// ─── Invariants ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_ingestion_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let service = IngestionService::new(store.clone());
    let host = HostMetadata::new("darwin");

    service.ingest_agent_report(1, &host, &s1_rows()).await.unwrap();
    let software_once = store.list_host_software(1).await.unwrap();
    let paths_once = store.list_host_installed_paths(1).await.unwrap();

    let outcome = service.ingest_agent_report(1, &host, &s1_rows()).await.unwrap();
    assert_eq!(outcome.inserted, 0);
    assert_eq!(outcome.deleted, 0);
    assert_eq!(store.list_host_software(1).await.unwrap(), software_once);
    assert_eq!(store.list_host_installed_paths(1).await.unwrap(), paths_once);
    assert_eq!(store.count_software().await.unwrap(), 2);
}

#[tokio::test]
async fn test_report_replaces_previous_set() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let service = IngestionService::new(store.clone());
    let host = HostMetadata::new("darwin");

    service.ingest_agent_report(1, &host, &s1_rows()).await.unwrap();

    let next = vec![
        row(&[
            ("name", "Visual Studio Code"),
            ("version", "1.84.2"),
            ("source", "apps"),
        ]),
        row(&[
            ("name", "Slack"),
            ("version", "4.35"),
            ("source", "apps"),
            ("installed_path", "/Applications/Slack.app"),
        ]),
        row(&[("name", ""), ("version", "1"), ("source", "apps")]),
    ];
    let outcome = service.ingest_agent_report(1, &host, &next).await.unwrap();
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.deleted, 1);
    assert_eq!(outcome.dropped, 1);

    let stored = store.list_host_software(1).await.unwrap();
    assert_eq!(names(&stored), vec!["Slack", "Visual Studio Code"]);
    let paths = store.list_host_installed_paths(1).await.unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].installed_path, "/Applications/Slack.app");

    // Chrome left the host but stays in the catalog until cleanup.
    assert_eq!(store.count_software().await.unwrap(), 3);
    assert_eq!(store.cleanup_orphan_software().await.unwrap(), 1);
    assert_eq!(store.count_software().await.unwrap(), 2);
}

#[tokio::test]
async fn test_catalog_shared_between_hosts() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let service = IngestionService::new(store.clone());

    service
        .ingest_agent_report(1, &HostMetadata::new("darwin"), &s1_rows())
        .await
        .unwrap();
    service
        .ingest_agent_report(2, &HostMetadata::new("darwin"), &s1_rows())
        .await
        .unwrap();
    service
        .ingest_agent_report(1, &HostMetadata::new("darwin"), &[])
        .await
        .unwrap();

    assert!(store.list_host_software(1).await.unwrap().is_empty());
    assert_eq!(store.list_host_software(2).await.unwrap().len(), 2);
    assert_eq!(store.cleanup_orphan_software().await.unwrap(), 0);
    assert_eq!(store.count_software().await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_reports_same_host_never_mix() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let service = IngestionService::new(store.clone());
    let host = HostMetadata::new("darwin");

    let report = |prefix: &str, version: &str| -> Vec<RawRow> {
        (0..30)
            .map(|i| {
                let name = format!("{prefix}-{i}");
                let path = format!("/Applications/{name}.app");
                row(&[
                    ("name", &name),
                    ("version", version),
                    ("source", "apps"),
                    ("installed_path", &path),
                ])
            })
            .collect()
    };
    let first = report("pkg", "1.0");
    let second = report("other", "2.0");

    for _ in 0..5 {
        let (a, b) = tokio::join!(
            service.ingest_agent_report(5, &host, &first),
            service.ingest_agent_report(5, &host, &second),
        );
        a.unwrap();
        b.unwrap();

        let stored = store.list_host_software(5).await.unwrap();
        assert_eq!(stored.len(), 30);
        let all_first = stored.iter().all(|s| s.name.starts_with("pkg-"));
        let all_second = stored.iter().all(|s| s.name.starts_with("other-"));
        assert!(all_first || all_second);

        let ids: BTreeSet<i64> = stored.iter().map(|s| s.id).collect();
        let paths = store.list_host_installed_paths(5).await.unwrap();
        assert_eq!(paths.len(), 30);
        assert!(paths.iter().all(|p| ids.contains(&p.software_id)));
    }
}

#[tokio::test]
async fn test_processor_bounds_concurrency() {
    let store = Arc::new(TestStore::new(Duration::from_millis(20)));
    let config = IngestionConfig {
        max_concurrent_hosts: 4,
        dispatch_interval_ms: 5,
        batch_size: 10,
        ..IngestionConfig::default()
    };
    let load = Arc::new(LoadManagedService::new(
        IngestionService::new(store.clone()),
        &config,
        system_clock(),
    ));
    let processor = AsyncProcessor::start(load.clone(), &config);

    for host_id in 0..30 {
        processor
            .submit_async(IngestionRequest::agent(
                host_id,
                HostMetadata::new("ubuntu"),
                packages(1),
            ))
            .unwrap();
    }
    processor.shutdown().await;

    assert_eq!(processor.stats().completed, 30);
    assert_eq!(load.metrics().success, 30);
    assert!(load.metrics().peak_in_flight <= 4);
    assert!(store.peak.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn test_high_priority_served_first_under_saturation() {
    let store = Arc::new(TestStore::new(Duration::from_millis(5)));
    let config = IngestionConfig {
        max_concurrent_hosts: 1,
        batch_size: 1,
        dispatch_interval_ms: 1,
        ..IngestionConfig::default()
    };
    let load = Arc::new(LoadManagedService::new(
        IngestionService::new(store),
        &config,
        system_clock(),
    ));
    let processor = AsyncProcessor::start(load, &config);

    for i in 0..20u32 {
        processor
            .submit_async(IngestionRequest::agent(
                i,
                HostMetadata::new("ubuntu"),
                packages(60),
            ))
            .unwrap();
        processor
            .submit_async(IngestionRequest::agent(
                100 + i,
                HostMetadata::new("ubuntu"),
                packages(1),
            ))
            .unwrap();
    }
    processor.shutdown().await;

    let stats = processor.stats();
    let high = &stats.priorities[0];
    let low = &stats.priorities[2];
    assert_eq!(high.completed, 20);
    assert_eq!(low.completed, 20);
    assert!(
        high.avg_latency_ms < low.avg_latency_ms,
        "high {} ms vs low {} ms",
        high.avg_latency_ms,
        low.avg_latency_ms
    );
}
