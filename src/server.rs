//! HTTP surface: report submission, tracking, health and metrics.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/hosts/{host_id}/software` | Submit an agent or MDM report |
//! | `GET`  | `/api/v1/tracking/summary` | Fleet cadence summary |
//! | `GET`  | `/api/v1/tracking/stale_hosts` | Hosts past the alert threshold |
//! | `GET`  | `/api/v1/tracking/over_active_hosts` | Hosts reporting too often |
//! | `GET`  | `/api/v1/tracking/host_status?host_id=N` | One host's status |
//! | `GET`  | `/api/v1/tracking/alerts` | Alerts derived from the summary |
//! | `GET`  | `/health` | Version and circuit state |
//! | `GET`  | `/metrics` | Load-manager and processor counters |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "rate limited: no token available before the deadline" } }
//! ```
//!
//! `bad_request` (400), `timeout`/`cancelled` (408), `rate_limited`/`queue_full` (429),
//! `persistence_transient`/`persistence_fatal` (500), `circuit_open`/`shutting_down` (503).

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::alerts::{derive_alerts, Alert};
use crate::breaker::CircuitState;
use crate::config::Config;
use crate::error::IngestError;
use crate::metrics::MetricsSnapshot;
use crate::models::{HostId, HostMetadata, IngestionKind, IngestionRequest, RawRow, Software};
use crate::processor::{AsyncProcessor, ProcessorSnapshot};
use crate::tracker::{HostStatus, IngestionTracker, TrackingSummary};

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<AsyncProcessor>,
    pub tracker: Arc<IngestionTracker>,
    /// Longest a synchronous submission may wait for a rate-limit token.
    pub admission_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/hosts/{host_id}/software", post(handle_submit))
        .route("/api/v1/tracking/summary", get(handle_summary))
        .route("/api/v1/tracking/stale_hosts", get(handle_stale_hosts))
        .route("/api/v1/tracking/over_active_hosts", get(handle_over_active_hosts))
        .route("/api/v1/tracking/host_status", get(handle_host_status))
        .route("/api/v1/tracking/alerts", get(handle_alerts))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn run_server(
    config: &Config,
    processor: Arc<AsyncProcessor>,
    tracker: Arc<IngestionTracker>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState {
        processor,
        tracker,
        admission_timeout: config.ingestion.database_timeout(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "ingestion server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after: Option<Duration>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(after) = self.retry_after {
            let secs = after.as_secs_f64().ceil() as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        retry_after: None,
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::RateLimited | IngestError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            IngestError::CircuitOpen { .. } | IngestError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IngestError::Timeout(_) | IngestError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            IngestError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = match &err {
            IngestError::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        };
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
            retry_after,
        }
    }
}

// ============ POST /api/v1/hosts/{host_id}/software ============

fn default_kind() -> IngestionKind {
    IngestionKind::Agent
}

/// Report submission body. Agent reports carry `rows`, MDM reports carry
/// `software`.
#[derive(Deserialize)]
struct SubmitReport {
    platform: String,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default = "default_kind")]
    kind: IngestionKind,
    #[serde(default)]
    rows: Vec<RawRow>,
    #[serde(default)]
    software: Vec<Software>,
    /// Return as soon as the report is queued.
    #[serde(default, rename = "async")]
    async_submit: bool,
}

#[derive(Serialize)]
struct SubmitResponse {
    host_id: HostId,
    status: &'static str,
}

async fn handle_submit(
    State(state): State<AppState>,
    Path(host_id): Path<HostId>,
    Json(body): Json<SubmitReport>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    if body.platform.trim().is_empty() {
        return Err(bad_request("platform must not be empty"));
    }
    let host = HostMetadata {
        platform: body.platform,
        hostname: body.hostname,
    };
    let request = match body.kind {
        IngestionKind::Agent => IngestionRequest::agent(host_id, host, body.rows),
        IngestionKind::Mdm => IngestionRequest::mdm(host_id, host, body.software),
    };

    if body.async_submit {
        state.processor.submit_async(request)?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                host_id,
                status: "accepted",
            }),
        ));
    }

    // A dropped connection drops this future, which cancels the request.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let request = request
        .with_cancel(cancel)
        .with_deadline(Instant::now() + state.admission_timeout);
    state.processor.submit_sync(request).await?;

    Ok((
        StatusCode::OK,
        Json(SubmitResponse {
            host_id,
            status: "ingested",
        }),
    ))
}

// ============ GET /api/v1/tracking/* ============

async fn handle_summary(State(state): State<AppState>) -> Json<TrackingSummary> {
    Json(state.tracker.summary())
}

#[derive(Serialize)]
struct HostList {
    count: usize,
    hosts: Vec<HostStatus>,
}

impl From<Vec<HostStatus>> for HostList {
    fn from(hosts: Vec<HostStatus>) -> Self {
        Self {
            count: hosts.len(),
            hosts,
        }
    }
}

async fn handle_stale_hosts(State(state): State<AppState>) -> Json<HostList> {
    Json(state.tracker.stale_hosts().into())
}

async fn handle_over_active_hosts(State(state): State<AppState>) -> Json<HostList> {
    Json(state.tracker.over_active_hosts().into())
}

#[derive(Deserialize)]
struct HostStatusQuery {
    host_id: Option<String>,
}

async fn handle_host_status(
    State(state): State<AppState>,
    Query(query): Query<HostStatusQuery>,
) -> Result<Json<HostStatus>, AppError> {
    let raw = query
        .host_id
        .ok_or_else(|| bad_request("host_id query parameter is required"))?;
    let host_id: HostId = raw
        .trim()
        .parse()
        .map_err(|_| bad_request(format!("invalid host_id: {:?}", raw)))?;
    Ok(Json(state.tracker.host_status(host_id)))
}

#[derive(Serialize)]
struct AlertsResponse {
    alerts: Vec<Alert>,
    summary: TrackingSummary,
}

async fn handle_alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    let summary = state.tracker.summary();
    Json(AlertsResponse {
        alerts: derive_alerts(&summary),
        summary,
    })
}

// ============ GET /health, GET /metrics ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    circuit_state: CircuitState,
    shutting_down: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let circuit_state = state.processor.load().circuit_state();
    let status = match circuit_state {
        CircuitState::Closed => "ok",
        CircuitState::HalfOpen | CircuitState::Open => "degraded",
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        circuit_state,
        shutting_down: state.processor.is_shutting_down(),
    })
}

#[derive(Serialize)]
struct MetricsResponse {
    circuit_state: CircuitState,
    circuit_failures: u32,
    load: MetricsSnapshot,
    processor: ProcessorSnapshot,
    tracked_hosts: usize,
}

async fn handle_metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let load = state.processor.load();
    Json(MetricsResponse {
        circuit_state: load.circuit_state(),
        circuit_failures: load.breaker().failure_count(),
        load: load.metrics(),
        processor: state.processor.stats(),
        tracked_hosts: state.tracker.tracked_hosts(),
    })
}
