//! # Software Ingestion
//!
//! Ingests per-host installed-software reports from endpoint agents and MDM
//! channels, normalizes them, and persists them as a deduplicated catalog,
//! per-host software sets and per-host installed paths.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐   ┌───────────┐
//! │   Reports    │──▶│ AsyncProcessor│──▶│ LoadManaged  │──▶│ Ingestion │
//! │ agent / MDM  │   │ intake+queues │   │ rate/sem/cb  │   │  Service  │
//! └──────────────┘   └───────────────┘   └──────────────┘   └─────┬─────┘
//!                                                                 │
//!                              ┌──────────────────────────────────┤
//!                              ▼                                  ▼
//!                        ┌───────────┐                      ┌───────────┐
//!                        │  Tracker  │                      │  SQLite   │
//!                        │ + alerts  │                      │   store   │
//!                        └───────────┘                      └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Catalog, host and request types |
//! | [`normalize`] | Raw row parsing and platform transforms |
//! | [`sanitize`] | Table-driven field fixes |
//! | [`service`] | Report → store mutation |
//! | [`store`] | Persistence trait, delta helpers, in-memory store |
//! | [`sqlite_store`] | SQLite store |
//! | [`rate_limit`] | Token bucket |
//! | [`breaker`] | Circuit breaker |
//! | [`metrics`] | Load-manager counters |
//! | [`load`] | Load-managed wrapper around the service |
//! | [`processor`] | Bounded intake, priority dispatch, worker pool |
//! | [`tracker`] | Per-host cadence tracking |
//! | [`alerts`] | Alerts derived from tracking |
//! | [`sweep`] | Periodic maintenance |
//! | [`server`] | HTTP API |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod alerts;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod load;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod processor;
pub mod rate_limit;
pub mod sanitize;
pub mod server;
pub mod service;
pub mod sqlite_store;
pub mod store;
pub mod sweep;
pub mod tracker;
