//! Raw row parsing and normalization.
//!
//! Turns the rows an agent reports (or the software list an MDM command
//! returns) into canonical [`Software`] records plus the set of installed-path
//! keys for the host. Nothing here performs I/O or fails a whole report:
//! malformed rows are logged at debug level and skipped.
//!
//! Per row:
//!
//! 1. validate `last_opened_at` (empty, `"0"`, or epoch seconds)
//! 2. trim text fields, require `name` and `source`
//! 3. platform transforms (kernel flag, MDM vendor and source)
//! 4. sanitizers
//! 5. installed-path key, when a path was reported

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

use crate::models::{
    installed_path_key, HostId, HostMetadata, IngestionKind, RawRow, Software,
    SOFTWARE_BUNDLE_IDENTIFIER_MAX_LEN, SOFTWARE_NAME_MAX_LEN, SOFTWARE_TEAM_IDENTIFIER_MAX_LEN,
    SOFTWARE_VENDOR_MAX_LEN, SOFTWARE_VERSION_MAX_LEN,
};
use crate::sanitize::sanitize;

/// Why a single row was dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("missing name")]
    MissingName,
    #[error("missing source")]
    MissingSource,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid last_opened_at value: {0:?}")]
pub struct InvalidLastOpenedAt(pub String);

/// Canonical output of one report.
#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub software: Vec<Software>,
    pub installed_paths: BTreeSet<String>,
    /// Rows skipped as malformed or filtered.
    pub dropped: usize,
}

static KERNEL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Debian/Ubuntu: linux-image-<ver>-<abi>-<flavor>
        r"^linux-image-[0-9]+\.[0-9]+\.[0-9]+-[0-9]+-[a-z0-9-]+$",
        // Amazon Linux
        r"^kernel$",
        // RHEL family
        r"^kernel-core$",
        // Arch
        r"^linux(-lts|-zen|-hardened)?$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid kernel pattern"))
    .collect()
});

/// Parse an agent's `last_opened_at` column.
///
/// Empty and `"0"` mean "never opened". Otherwise the value must be a
/// non-negative decimal number of epoch seconds; fractions are truncated.
pub fn parse_last_opened_at(value: &str) -> Result<Option<DateTime<Utc>>, InvalidLastOpenedAt> {
    let value = value.trim();
    if value.is_empty() || value == "0" {
        return Ok(None);
    }

    let secs = match value.parse::<i64>() {
        Ok(secs) => secs,
        Err(_) => match value.parse::<f64>() {
            Ok(f) if f.is_finite() => f.trunc() as i64,
            _ => return Err(InvalidLastOpenedAt(value.to_string())),
        },
    };
    if secs < 0 {
        return Err(InvalidLastOpenedAt(value.to_string()));
    }
    if secs == 0 {
        return Ok(None);
    }
    DateTime::from_timestamp(secs, 0)
        .map(Some)
        .ok_or_else(|| InvalidLastOpenedAt(value.to_string()))
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

fn truncate_vendor(vendor: &str) -> String {
    if vendor.chars().count() > SOFTWARE_VENDOR_MAX_LEN {
        format!("{}...", truncate_chars(vendor, SOFTWARE_VENDOR_MAX_LEN - 3))
    } else {
        vendor.to_string()
    }
}

fn field<'a>(row: &'a RawRow, key: &str) -> &'a str {
    row.get(key).map(|v| v.trim()).unwrap_or("")
}

/// Build a [`Software`] record from one raw row.
///
/// An invalid `last_opened_at` leaves the field empty rather than failing.
pub fn software_from_row(row: &RawRow) -> Result<Software, RowError> {
    let name = field(row, "name");
    if name.is_empty() {
        return Err(RowError::MissingName);
    }
    let source = field(row, "source");
    if source.is_empty() {
        return Err(RowError::MissingSource);
    }

    // Older agents report the host browser under `browser`.
    let extension_for = match field(row, "extension_for") {
        "" => field(row, "browser"),
        v => v,
    };

    Ok(Software {
        id: 0,
        name: truncate_chars(name, SOFTWARE_NAME_MAX_LEN),
        version: truncate_chars(field(row, "version"), SOFTWARE_VERSION_MAX_LEN),
        source: source.to_string(),
        vendor: truncate_vendor(field(row, "vendor")),
        bundle_identifier: truncate_chars(
            field(row, "bundle_identifier"),
            SOFTWARE_BUNDLE_IDENTIFIER_MAX_LEN,
        ),
        release: field(row, "release").to_string(),
        arch: field(row, "arch").to_string(),
        extension_id: field(row, "extension_id").to_string(),
        extension_for: extension_for.to_string(),
        last_opened_at: parse_last_opened_at(field(row, "last_opened_at")).unwrap_or(None),
        is_kernel: false,
    })
}

pub fn is_kernel_name(name: &str) -> bool {
    KERNEL_PATTERNS.iter().any(|re| re.is_match(name))
}

/// Source assigned to MDM-reported apps by host platform.
pub fn mdm_source_for_platform(platform: &str) -> &'static str {
    match platform {
        "ios" => "ios_apps",
        "ipados" => "ipados_apps",
        "darwin" => "app_store_apps",
        _ => "mdm_apps",
    }
}

/// `com.<vendor>.<rest>` → `<vendor>` lower-cased.
fn vendor_from_bundle_identifier(bundle_identifier: &str) -> Option<String> {
    let mut parts = bundle_identifier.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("com"), Some(vendor), Some(rest)) if !vendor.is_empty() && !rest.is_empty() => {
            Some(vendor.to_lowercase())
        }
        _ => None,
    }
}

/// Platform-specific rewrites.
pub fn apply_platform_transforms(software: &mut Software, host: &HostMetadata, kind: IngestionKind) {
    if host.is_linux() && is_kernel_name(&software.name) {
        software.is_kernel = true;
    }

    if kind == IngestionKind::Mdm {
        if software.vendor.is_empty() {
            if let Some(vendor) = vendor_from_bundle_identifier(&software.bundle_identifier) {
                software.vendor = vendor;
            }
        }
        software.source = mdm_source_for_platform(&host.platform).to_string();
    }
}

/// Whether to leave `software` out of the host's set entirely.
fn should_remove(host: &HostMetadata, software: &Software) -> bool {
    // Parallels surfaces Windows guest apps as macOS applications.
    host.platform == "darwin" && software.bundle_identifier.starts_with("com.parallels.winapp")
}

/// Accumulates canonical software, merging entries with the same identity.
#[derive(Default)]
struct ReportBuilder {
    index: HashMap<String, usize>,
    report: ParsedReport,
}

impl ReportBuilder {
    fn push(&mut self, software: Software) -> String {
        let unique = software.unique_str();
        match self.index.get(&unique) {
            Some(&i) => {
                let existing = &mut self.report.software[i];
                if software.last_opened_at > existing.last_opened_at {
                    existing.last_opened_at = software.last_opened_at;
                }
                existing.is_kernel |= software.is_kernel;
            }
            None => {
                self.index.insert(unique.clone(), self.report.software.len());
                self.report.software.push(software);
            }
        }
        unique
    }

    fn finish(self) -> ParsedReport {
        self.report
    }
}

/// Parse a full agent report.
pub fn parse_agent_rows(host_id: HostId, host: &HostMetadata, rows: &[RawRow]) -> ParsedReport {
    let mut builder = ReportBuilder::default();

    for row in rows {
        let raw_last_opened = field(row, "last_opened_at");
        if let Err(err) = parse_last_opened_at(raw_last_opened) {
            debug!(host_id, row = ?row, %err, "host reported software with invalid last opened timestamp");
        }

        let mut software = match software_from_row(row) {
            Ok(s) => s,
            Err(err) => {
                debug!(host_id, row = ?row, %err, "failed to parse software row");
                builder.report.dropped += 1;
                continue;
            }
        };

        apply_platform_transforms(&mut software, host, IngestionKind::Agent);
        if should_remove(host, &software) {
            builder.report.dropped += 1;
            continue;
        }
        sanitize(&mut software);

        let unique = builder.push(software);

        let installed_path = field(row, "installed_path");
        if !installed_path.is_empty() && !installed_path.eq_ignore_ascii_case("null") {
            let team_identifier =
                truncate_chars(field(row, "team_identifier"), SOFTWARE_TEAM_IDENTIFIER_MAX_LEN);
            let key = installed_path_key(
                installed_path,
                &team_identifier,
                field(row, "cdhash_sha256"),
                &unique,
            );
            builder.report.installed_paths.insert(key);
        }
    }

    builder.finish()
}

/// Normalize pre-structured MDM software. Raw parsing is skipped, but
/// trimming, required fields, transforms and sanitizers still apply.
pub fn normalize_mdm_software(
    host_id: HostId,
    host: &HostMetadata,
    software: &[Software],
) -> ParsedReport {
    let mut builder = ReportBuilder::default();

    for incoming in software {
        let mut s = incoming.clone();
        s.id = 0;
        s.name = truncate_chars(s.name.trim(), SOFTWARE_NAME_MAX_LEN);
        s.version = truncate_chars(s.version.trim(), SOFTWARE_VERSION_MAX_LEN);
        s.bundle_identifier =
            truncate_chars(s.bundle_identifier.trim(), SOFTWARE_BUNDLE_IDENTIFIER_MAX_LEN);
        s.vendor = truncate_vendor(s.vendor.trim());
        s.release = s.release.trim().to_string();
        s.arch = s.arch.trim().to_string();
        s.extension_id = s.extension_id.trim().to_string();
        s.extension_for = s.extension_for.trim().to_string();

        if s.name.is_empty() {
            debug!(host_id, bundle_identifier = %s.bundle_identifier, "dropping MDM software without a name");
            builder.report.dropped += 1;
            continue;
        }

        apply_platform_transforms(&mut s, host, IngestionKind::Mdm);
        if should_remove(host, &s) {
            builder.report.dropped += 1;
            continue;
        }
        sanitize(&mut s);
        builder.push(s);
    }

    builder.finish()
}
