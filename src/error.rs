//! Typed errors returned to ingestion callers.
//!
//! Store adapters work in `anyhow`; their failures cross into the pipeline
//! as [`IngestError::Persistence`] with the original error kept as the
//! source and an operation context prepended.

use std::time::Duration;
use thiserror::Error;

/// Whether a persistence failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceKind {
    Transient,
    Fatal,
}

/// Marker a store returns for failures that should be retried
/// (lost connection, lock contention).
#[derive(Debug, Error)]
#[error("store unavailable: {0}")]
pub struct StoreUnavailable(pub String);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("rate limited: no token available before the deadline")]
    RateLimited,

    #[error("ingestion queue is full")]
    QueueFull,

    #[error("circuit breaker is open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("request cancelled")]
    Cancelled,

    #[error("database call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{context}: {source:#}")]
    Persistence {
        context: String,
        kind: PersistenceKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("ingestion processor is shutting down")]
    ShuttingDown,
}

impl IngestError {
    /// Wrap a store error, classifying it as transient or fatal.
    pub fn persistence(context: impl Into<String>, source: anyhow::Error) -> Self {
        let kind = classify(&source);
        IngestError::Persistence {
            context: context.into(),
            kind,
            source,
        }
    }

    /// Prepend operation context. Only persistence errors carry context;
    /// admission errors are already self-describing.
    pub fn context(self, outer: &str) -> Self {
        match self {
            IngestError::Persistence {
                context,
                kind,
                source,
            } => IngestError::Persistence {
                context: format!("{}: {}", outer, context),
                kind,
                source,
            },
            other => other,
        }
    }

    /// Stable snake_case label for metrics and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::RateLimited => "rate_limited",
            IngestError::QueueFull => "queue_full",
            IngestError::CircuitOpen { .. } => "circuit_open",
            IngestError::Cancelled => "cancelled",
            IngestError::Timeout(_) => "timeout",
            IngestError::Persistence {
                kind: PersistenceKind::Transient,
                ..
            } => "persistence_transient",
            IngestError::Persistence {
                kind: PersistenceKind::Fatal,
                ..
            } => "persistence_fatal",
            IngestError::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            IngestError::RateLimited
            | IngestError::QueueFull
            | IngestError::CircuitOpen { .. }
            | IngestError::Timeout(_) => true,
            IngestError::Persistence { kind, .. } => *kind == PersistenceKind::Transient,
            IngestError::Cancelled | IngestError::ShuttingDown => false,
        }
    }

    /// Failures that count against the circuit breaker.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            IngestError::Persistence { .. } | IngestError::Timeout(_)
        )
    }
}

fn classify(err: &anyhow::Error) -> PersistenceKind {
    for cause in err.chain() {
        if cause.downcast_ref::<StoreUnavailable>().is_some() {
            return PersistenceKind::Transient;
        }
        if let Some(db_err) = cause.downcast_ref::<sqlx::Error>() {
            return classify_sqlx(db_err);
        }
    }
    PersistenceKind::Fatal
}

fn classify_sqlx(err: &sqlx::Error) -> PersistenceKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => PersistenceKind::Transient,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            if msg.contains("locked") || msg.contains("busy") {
                PersistenceKind::Transient
            } else {
                PersistenceKind::Fatal
            }
        }
        _ => PersistenceKind::Fatal,
    }
}
