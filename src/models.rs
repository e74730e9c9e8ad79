//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the catalog entries, host mappings, installed paths,
//! and transient requests that flow from agent reports to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;

/// Reserved separator joining the parts of unique strings and installed-path keys.
pub const SOFTWARE_FIELD_SEPARATOR: &str = "\u{0}";

pub const SOFTWARE_NAME_MAX_LEN: usize = 255;
pub const SOFTWARE_VERSION_MAX_LEN: usize = 255;
pub const SOFTWARE_BUNDLE_IDENTIFIER_MAX_LEN: usize = 255;
/// Vendors longer than this are cut and suffixed with `...`.
pub const SOFTWARE_VENDOR_MAX_LEN: usize = 114;
pub const SOFTWARE_TEAM_IDENTIFIER_MAX_LEN: usize = 10;

/// Identifier of a managed host.
pub type HostId = u32;

/// A raw row as reported by the agent, keyed by column name.
pub type RawRow = HashMap<String, String>;

/// Platforms treated as Linux variants for kernel detection.
pub const LINUX_PLATFORMS: &[&str] = &[
    "linux",
    "ubuntu",
    "debian",
    "rhel",
    "centos",
    "sles",
    "kali",
    "gentoo",
    "amzn",
    "pop",
    "arch",
    "archarm",
    "linuxmint",
    "void",
    "nixos",
    "endeavouros",
    "manjaro",
    "opensuse-leap",
    "opensuse-tumbleweed",
    "tuxedo",
    "neon",
    "fedora",
];

/// A catalog entry. Created on first sight and never mutated afterwards.
///
/// `id` is zero until the store has assigned a catalog row. An empty
/// `bundle_identifier` means the software has none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Software {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub bundle_identifier: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub extension_id: String,
    #[serde(default)]
    pub extension_for: String,
    #[serde(default)]
    pub last_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_kernel: bool,
}

impl Software {
    /// The identity of this entry as a single string.
    ///
    /// `name`, `version`, `source` and `bundle_identifier` are always present;
    /// `release`/`arch` and `extension_id`/`extension_for` are appended only
    /// when either member of the pair is set.
    pub fn unique_str(&self) -> String {
        let mut parts: Vec<&str> = vec![
            &self.name,
            &self.version,
            &self.source,
            &self.bundle_identifier,
        ];
        if !self.release.is_empty() || !self.arch.is_empty() {
            parts.push(&self.release);
            parts.push(&self.arch);
        }
        if !self.extension_id.is_empty() || !self.extension_for.is_empty() {
            parts.push(&self.extension_id);
            parts.push(&self.extension_for);
        }
        parts.join(SOFTWARE_FIELD_SEPARATOR)
    }

    /// Hex sha256 over the full identity tuple; unique per catalog row.
    pub fn checksum(&self) -> String {
        let cols = [
            self.name.as_str(),
            &self.version,
            &self.source,
            &self.bundle_identifier,
            &self.release,
            &self.arch,
            &self.extension_id,
            &self.extension_for,
        ];
        let mut hasher = Sha256::new();
        hasher.update(cols.join(SOFTWARE_FIELD_SEPARATOR).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One `(host_id, software_id)` pair of a host-software set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSoftware {
    pub host_id: HostId,
    pub software_id: i64,
    pub last_opened_at: Option<DateTime<Utc>>,
}

/// A location at which a given software is installed on a given host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstalledPath {
    pub host_id: HostId,
    pub software_id: i64,
    pub installed_path: String,
    pub team_identifier: String,
    pub cdhash_sha256: String,
}

impl InstalledPath {
    /// Rebuild the composite key given the owning software's unique string.
    pub fn key(&self, unique_str: &str) -> String {
        installed_path_key(
            &self.installed_path,
            &self.team_identifier,
            &self.cdhash_sha256,
            unique_str,
        )
    }
}

/// Composite key for an installed path. Inputs are used as given; callers
/// truncate the team identifier beforehand.
pub fn installed_path_key(
    installed_path: &str,
    team_identifier: &str,
    cdhash_sha256: &str,
    unique_str: &str,
) -> String {
    [installed_path, team_identifier, cdhash_sha256, unique_str].join(SOFTWARE_FIELD_SEPARATOR)
}

/// Parts of an installed-path key, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPathKeyParts<'a> {
    pub installed_path: &'a str,
    pub team_identifier: &'a str,
    pub cdhash_sha256: &'a str,
    pub unique_str: &'a str,
}

/// Split a key built by [`installed_path_key`]. The unique string keeps its
/// own separators.
pub fn split_installed_path_key(key: &str) -> Option<InstalledPathKeyParts<'_>> {
    let mut parts = key.splitn(4, SOFTWARE_FIELD_SEPARATOR);
    Some(InstalledPathKeyParts {
        installed_path: parts.next()?,
        team_identifier: parts.next()?,
        cdhash_sha256: parts.next()?,
        unique_str: parts.next()?,
    })
}

/// Metadata about the reporting host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadata {
    pub platform: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl HostMetadata {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            hostname: None,
        }
    }

    pub fn is_linux(&self) -> bool {
        LINUX_PLATFORMS.contains(&self.platform.as_str())
    }
}

/// Which channel delivered a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionKind {
    Agent,
    Mdm,
}

/// Dispatch class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Small reports go first: `<=10 → high`, `11..=50 → normal`, `>50 → low`.
    pub fn from_payload_len(len: usize) -> Self {
        match len {
            0..=10 => Priority::High,
            11..=50 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// Report contents: raw agent rows or pre-structured MDM software.
#[derive(Debug, Clone)]
pub enum ReportPayload {
    Agent(Vec<RawRow>),
    Mdm(Vec<Software>),
}

impl ReportPayload {
    pub fn kind(&self) -> IngestionKind {
        match self {
            ReportPayload::Agent(_) => IngestionKind::Agent,
            ReportPayload::Mdm(_) => IngestionKind::Mdm,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReportPayload::Agent(rows) => rows.len(),
            ReportPayload::Mdm(software) => software.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sender half of a per-request result channel.
pub type ResultSender = oneshot::Sender<Result<(), IngestError>>;

/// A transient request; lives until its worker returns.
#[derive(Debug)]
pub struct IngestionRequest {
    pub host_id: HostId,
    pub host: HostMetadata,
    pub payload: ReportPayload,
    pub priority: Priority,
    pub result_tx: Option<ResultSender>,
    pub enqueued_at: DateTime<Utc>,
    /// Fired by the caller to abandon the request.
    pub cancel: CancellationToken,
    /// Latest instant the caller is willing to wait for admission.
    pub deadline: Option<Instant>,
}

impl IngestionRequest {
    pub fn new(host_id: HostId, host: HostMetadata, payload: ReportPayload) -> Self {
        let priority = Priority::from_payload_len(payload.len());
        Self {
            host_id,
            host,
            payload,
            priority,
            result_tx: None,
            enqueued_at: Utc::now(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn agent(host_id: HostId, host: HostMetadata, rows: Vec<RawRow>) -> Self {
        Self::new(host_id, host, ReportPayload::Agent(rows))
    }

    pub fn mdm(host_id: HostId, host: HostMetadata, software: Vec<Software>) -> Self {
        Self::new(host_id, host, ReportPayload::Mdm(software))
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_result_channel(mut self, tx: ResultSender) -> Self {
        self.result_tx = Some(tx);
        self
    }

    pub fn kind(&self) -> IngestionKind {
        self.payload.kind()
    }

    /// Deliver `result` on the result channel, if the caller attached one.
    pub fn complete(&mut self, result: Result<(), IngestError>) {
        if let Some(tx) = self.result_tx.take() {
            // The receiver may have given up waiting.
            let _ = tx.send(result);
        }
    }
}
