//! Persistence abstraction for host software.
//!
//! The [`SoftwareStore`] trait is the only way the pipeline touches relational
//! state. Implementations compute deltas against three tables (catalog,
//! host mapping, installed paths) and guarantee per-host atomicity.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`replace_host_software`](SoftwareStore::replace_host_software) | Make the host's set equal the report |
//! | [`replace_host_installed_paths`](SoftwareStore::replace_host_installed_paths) | Make the host's path set equal the report |
//! | [`replace_host_report`](SoftwareStore::replace_host_report) | Both of the above as one unit |
//! | [`cleanup_orphan_software`](SoftwareStore::cleanup_orphan_software) | Drop catalog rows no host references |

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{split_installed_path_key, HostId, InstalledPath, Software};

/// What a host-software replacement changed.
///
/// Opaque to callers; carries the catalog ids the installed-path step needs
/// to resolve reported keys to software rows.
#[derive(Debug, Clone, Default)]
pub struct MutationResult {
    was_current: Vec<Software>,
    inserted: Vec<Software>,
    deleted: Vec<Software>,
}

impl MutationResult {
    pub fn new(was_current: Vec<Software>, inserted: Vec<Software>, deleted: Vec<Software>) -> Self {
        Self {
            was_current,
            inserted,
            deleted,
        }
    }

    pub fn inserted(&self) -> &[Software] {
        &self.inserted
    }

    pub fn deleted(&self) -> &[Software] {
        &self.deleted
    }

    /// Host software after the mutation: previous set, minus deleted, plus inserted.
    pub fn current_installed(&self) -> Vec<Software> {
        let deleted: HashSet<i64> = self.deleted.iter().map(|s| s.id).collect();
        let mut current: Vec<Software> = self
            .was_current
            .iter()
            .filter(|s| !deleted.contains(&s.id))
            .cloned()
            .collect();
        current.extend(self.inserted.iter().cloned());
        current
    }
}

/// An installed-path row with its storage id.
#[derive(Debug, Clone)]
pub struct StoredPath {
    pub id: i64,
    pub path: InstalledPath,
}

/// Abstract persistence backend for the ingestion pipeline.
#[async_trait]
pub trait SoftwareStore: Send + Sync {
    /// Replace the host's software set with `software`, creating catalog rows
    /// for anything not yet known. Atomic per host.
    async fn replace_host_software(
        &self,
        host_id: HostId,
        software: &[Software],
    ) -> Result<MutationResult>;

    /// Replace the host's installed-path set with `reported`.
    ///
    /// Fails if the host's software set no longer matches `mutation`, i.e.
    /// another report for the host was applied in between.
    async fn replace_host_installed_paths(
        &self,
        host_id: HostId,
        reported: &BTreeSet<String>,
        mutation: &MutationResult,
    ) -> Result<()>;

    /// Replace the host's software set and installed-path set together.
    /// Either both are applied or neither is, including when the returned
    /// future is dropped before completion.
    async fn replace_host_report(
        &self,
        host_id: HostId,
        software: &[Software],
        reported: &BTreeSet<String>,
    ) -> Result<MutationResult>;

    /// Delete catalog rows no host references. Returns the number removed.
    async fn cleanup_orphan_software(&self) -> Result<u64>;

    /// Software currently installed on a host, with catalog ids and the
    /// host's `last_opened_at`.
    async fn list_host_software(&self, host_id: HostId) -> Result<Vec<Software>>;

    async fn list_host_installed_paths(&self, host_id: HostId) -> Result<Vec<InstalledPath>>;

    /// Number of catalog rows.
    async fn count_software(&self) -> Result<i64>;
}

/// Whether `incoming` matches `current` closely enough to skip writing.
///
/// Sets must hold the same identities, and no incoming `last_opened_at` may
/// be newer than the stored one by `min_last_opened_at_diff` or more.
pub fn nothing_changed(
    current: &[Software],
    incoming: &[Software],
    min_last_opened_at_diff: Duration,
) -> bool {
    if current.len() != incoming.len() {
        return false;
    }

    let current_map: HashMap<String, &Software> =
        current.iter().map(|s| (s.unique_str(), s)).collect();
    for s in incoming {
        let Some(cur) = current_map.get(&s.unique_str()) else {
            return false;
        };
        if let Some(new_last) = s.last_opened_at {
            match cur.last_opened_at {
                None => return false,
                Some(old_last) if new_last - old_last >= min_last_opened_at_diff => return false,
                _ => {}
            }
        }
    }
    true
}

/// Whether the host row's `last_opened_at` should take the incoming value.
pub fn should_refresh_last_opened(
    current: &Software,
    incoming: &Software,
    min_last_opened_at_diff: Duration,
) -> bool {
    match (current.last_opened_at, incoming.last_opened_at) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(old), Some(new)) => new - old >= min_last_opened_at_diff,
    }
}

/// Check that `mutation` still describes the host's stored software set.
pub fn ensure_mutation_current(
    host_id: HostId,
    mutation: &MutationResult,
    stored: &[Software],
) -> Result<()> {
    let expected: BTreeSet<i64> = mutation.current_installed().iter().map(|s| s.id).collect();
    let actual: BTreeSet<i64> = stored.iter().map(|s| s.id).collect();
    if expected != actual {
        bail!(
            "software set of host {} changed since it was replaced; installed paths not applied",
            host_id
        );
    }
    Ok(())
}

/// Rows to insert and row ids to delete so the host's stored paths equal
/// `reported`.
///
/// `host_software` is the host's set after the software replacement; every
/// reported key must resolve to one of its entries.
pub fn installed_paths_delta(
    host_id: HostId,
    reported: &BTreeSet<String>,
    stored: &[StoredPath],
    host_software: &[Software],
) -> Result<(Vec<InstalledPath>, Vec<i64>)> {
    if !reported.is_empty() && host_software.is_empty() {
        bail!(
            "software installed paths for host {} were reported but host contains no software",
            host_id
        );
    }

    let by_id: HashMap<i64, &Software> = host_software.iter().map(|s| (s.id, s)).collect();
    let by_unique: HashMap<String, &Software> =
        host_software.iter().map(|s| (s.unique_str(), s)).collect();

    let mut to_delete = Vec::new();
    let mut stored_keys = HashSet::new();
    for row in stored {
        let Some(s) = by_id.get(&row.path.software_id) else {
            // software no longer on the host
            to_delete.push(row.id);
            continue;
        };
        let key = row.path.key(&s.unique_str());
        if reported.contains(&key) {
            stored_keys.insert(key);
        } else {
            to_delete.push(row.id);
        }
    }

    let mut to_insert = Vec::new();
    for key in reported {
        if stored_keys.contains(key) {
            continue;
        }
        let Some(parts) = split_installed_path_key(key) else {
            bail!("malformed installed path key for host {}", host_id);
        };
        let Some(s) = by_unique.get(parts.unique_str) else {
            bail!(
                "reported installed path {:?} does not belong to any stored software entry",
                parts.installed_path
            );
        };
        to_insert.push(InstalledPath {
            host_id,
            software_id: s.id,
            installed_path: parts.installed_path.to_string(),
            team_identifier: parts.team_identifier.to_string(),
            cdhash_sha256: parts.cdhash_sha256.to_string(),
        });
    }

    Ok((to_insert, to_delete))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::installed_path_key;
    use chrono::{TimeZone, Utc};

    fn sw(id: i64, name: &str) -> Software {
        Software {
            id,
            name: name.into(),
            version: "1.0".into(),
            source: "apps".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_nothing_changed_same_set() {
        let a = vec![sw(1, "a"), sw(2, "b")];
        let b = vec![sw(0, "b"), sw(0, "a")];
        assert!(nothing_changed(&a, &b, Duration::seconds(1)));
    }

    #[test]
    fn test_nothing_changed_detects_membership_and_last_opened() {
        let a = vec![sw(1, "a")];
        assert!(!nothing_changed(&a, &[sw(0, "z")], Duration::seconds(1)));

        let mut newer = sw(0, "a");
        newer.last_opened_at = Some(Utc.timestamp_opt(1_000, 0).unwrap());
        assert!(!nothing_changed(&a, &[newer.clone()], Duration::seconds(1)));

        let mut stored = sw(1, "a");
        stored.last_opened_at = Some(Utc.timestamp_opt(1_000, 0).unwrap());
        assert!(nothing_changed(&[stored], &[newer], Duration::seconds(1)));
    }

    #[test]
    fn test_current_installed() {
        let result = MutationResult::new(
            vec![sw(1, "a"), sw(2, "b")],
            vec![sw(3, "c")],
            vec![sw(2, "b")],
        );
        let ids: Vec<i64> = result.current_installed().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_paths_delta_inserts_and_deletes() {
        let host = vec![sw(1, "a"), sw(2, "b")];
        let stored = vec![
            StoredPath {
                id: 10,
                path: InstalledPath {
                    host_id: 7,
                    software_id: 1,
                    installed_path: "/keep".into(),
                    team_identifier: String::new(),
                    cdhash_sha256: String::new(),
                },
            },
            StoredPath {
                id: 11,
                path: InstalledPath {
                    host_id: 7,
                    software_id: 1,
                    installed_path: "/gone".into(),
                    team_identifier: String::new(),
                    cdhash_sha256: String::new(),
                },
            },
            StoredPath {
                id: 12,
                path: InstalledPath {
                    host_id: 7,
                    software_id: 99,
                    installed_path: "/uninstalled".into(),
                    team_identifier: String::new(),
                    cdhash_sha256: String::new(),
                },
            },
        ];
        let reported: BTreeSet<String> = [
            installed_path_key("/keep", "", "", &host[0].unique_str()),
            installed_path_key("/new", "TEAM", "", &host[1].unique_str()),
        ]
        .into_iter()
        .collect();

        let (ins, del) = installed_paths_delta(7, &reported, &stored, &host).unwrap();
        assert_eq!(del, vec![11, 12]);
        assert_eq!(ins.len(), 1);
        assert_eq!(ins[0].software_id, 2);
        assert_eq!(ins[0].installed_path, "/new");
        assert_eq!(ins[0].team_identifier, "TEAM");
    }

    #[test]
    fn test_stale_mutation_rejected() {
        let mutation = MutationResult::new(vec![sw(1, "a")], Vec::new(), Vec::new());
        assert!(ensure_mutation_current(1, &mutation, &[sw(1, "a")]).is_ok());
        assert!(ensure_mutation_current(1, &mutation, &[sw(2, "b")]).is_err());
    }

    #[test]
    fn test_paths_delta_errors() {
        let reported: BTreeSet<String> =
            [installed_path_key("/x", "", "", &sw(0, "a").unique_str())].into_iter().collect();
        assert!(installed_paths_delta(1, &reported, &[], &[]).is_err());
        assert!(installed_paths_delta(1, &reported, &[], &[sw(1, "other")]).is_err());
    }
}
