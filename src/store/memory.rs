//! In-memory [`SoftwareStore`] implementation for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so every replacement is
//! atomic with respect to every other one. A full report is applied to a
//! copy of the state that replaces the live one only once both steps succeed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::{HostId, InstalledPath, Software};

use super::{
    ensure_mutation_current, installed_paths_delta, nothing_changed, should_refresh_last_opened,
    MutationResult, SoftwareStore, StoredPath,
};

#[derive(Default, Clone)]
struct Inner {
    catalog: HashMap<i64, Software>,
    by_checksum: HashMap<String, i64>,
    next_software_id: i64,
    host_software: HashMap<HostId, HashMap<i64, Option<DateTime<Utc>>>>,
    paths: HashMap<HostId, Vec<StoredPath>>,
    next_path_id: i64,
}

impl Inner {
    fn host_list(&self, host_id: HostId) -> Vec<Software> {
        let mut list: Vec<Software> = self
            .host_software
            .get(&host_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(id, last_opened)| {
                        self.catalog.get(id).map(|s| Software {
                            last_opened_at: *last_opened,
                            ..s.clone()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        list.sort_by_key(|s| s.id);
        list
    }

    fn catalog_id(&mut self, software: &Software) -> i64 {
        let checksum = software.checksum();
        if let Some(id) = self.by_checksum.get(&checksum) {
            return *id;
        }
        self.next_software_id += 1;
        let id = self.next_software_id;
        self.catalog.insert(
            id,
            Software {
                id,
                last_opened_at: None,
                ..software.clone()
            },
        );
        self.by_checksum.insert(checksum, id);
        id
    }

    fn replace_software(
        &mut self,
        host_id: HostId,
        software: &[Software],
        min_last_opened_at_diff: Duration,
    ) -> MutationResult {
        let current = self.host_list(host_id);
        if nothing_changed(&current, software, min_last_opened_at_diff) {
            return MutationResult::new(current, Vec::new(), Vec::new());
        }

        let current_map: HashMap<String, &Software> =
            current.iter().map(|s| (s.unique_str(), s)).collect();
        let incoming_map: HashMap<String, &Software> =
            software.iter().map(|s| (s.unique_str(), s)).collect();

        let deleted: Vec<Software> = current
            .iter()
            .filter(|s| !incoming_map.contains_key(&s.unique_str()))
            .cloned()
            .collect();

        let mut inserted = Vec::new();
        let mut refreshed = Vec::new();
        let mut incoming_keys: Vec<&String> = incoming_map.keys().collect();
        incoming_keys.sort();
        for key in incoming_keys {
            let new_sw = incoming_map[key];
            match current_map.get(key) {
                None => {
                    let id = self.catalog_id(new_sw);
                    inserted.push(Software {
                        id,
                        ..new_sw.clone()
                    });
                }
                Some(cur) => {
                    if should_refresh_last_opened(cur, new_sw, min_last_opened_at_diff) {
                        refreshed.push((cur.id, new_sw.last_opened_at));
                    }
                }
            }
        }

        let entries = self.host_software.entry(host_id).or_default();
        for s in &deleted {
            entries.remove(&s.id);
        }
        for s in &inserted {
            entries.insert(s.id, s.last_opened_at);
        }
        for (id, last_opened) in refreshed {
            entries.insert(id, last_opened);
        }

        if !deleted.is_empty() {
            if let Some(paths) = self.paths.get_mut(&host_id) {
                paths.retain(|p| !deleted.iter().any(|d| d.id == p.path.software_id));
            }
        }

        MutationResult::new(current, inserted, deleted)
    }

    fn replace_paths(
        &mut self,
        host_id: HostId,
        reported: &BTreeSet<String>,
        host_software: &[Software],
    ) -> Result<()> {
        let stored = self.paths.get(&host_id).cloned().unwrap_or_default();
        let (to_insert, to_delete) =
            installed_paths_delta(host_id, reported, &stored, host_software)?;
        if to_insert.is_empty() && to_delete.is_empty() {
            return Ok(());
        }

        let mut next_id = self.next_path_id;
        let paths = self.paths.entry(host_id).or_default();
        paths.retain(|p| !to_delete.contains(&p.id));
        for path in to_insert {
            next_id += 1;
            paths.push(StoredPath { id: next_id, path });
        }
        self.next_path_id = next_id;
        Ok(())
    }
}

/// In-memory store.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    min_last_opened_at_diff: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_min_last_opened_at_diff(Duration::seconds(1))
    }

    pub fn with_min_last_opened_at_diff(min_last_opened_at_diff: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            min_last_opened_at_diff,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SoftwareStore for InMemoryStore {
    async fn replace_host_software(
        &self,
        host_id: HostId,
        software: &[Software],
    ) -> Result<MutationResult> {
        let mut inner = self.write()?;
        Ok(inner.replace_software(host_id, software, self.min_last_opened_at_diff))
    }

    async fn replace_host_installed_paths(
        &self,
        host_id: HostId,
        reported: &BTreeSet<String>,
        mutation: &MutationResult,
    ) -> Result<()> {
        let mut inner = self.write()?;
        let host_software = inner.host_list(host_id);
        ensure_mutation_current(host_id, mutation, &host_software)?;
        inner.replace_paths(host_id, reported, &host_software)
    }

    async fn replace_host_report(
        &self,
        host_id: HostId,
        software: &[Software],
        reported: &BTreeSet<String>,
    ) -> Result<MutationResult> {
        let mut inner = self.write()?;
        let mut staged = inner.clone();
        let mutation = staged.replace_software(host_id, software, self.min_last_opened_at_diff);
        staged.replace_paths(host_id, reported, &mutation.current_installed())?;
        *inner = staged;
        Ok(mutation)
    }

    async fn cleanup_orphan_software(&self) -> Result<u64> {
        let mut inner = self.write()?;
        let referenced: BTreeSet<i64> = inner
            .host_software
            .values()
            .flat_map(|entries| entries.keys().copied())
            .chain(
                inner
                    .paths
                    .values()
                    .flat_map(|paths| paths.iter().map(|p| p.path.software_id)),
            )
            .collect();

        let orphans: Vec<i64> = inner
            .catalog
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();
        for id in &orphans {
            if let Some(s) = inner.catalog.remove(id) {
                inner.by_checksum.remove(&s.checksum());
            }
        }
        Ok(orphans.len() as u64)
    }

    async fn list_host_software(&self, host_id: HostId) -> Result<Vec<Software>> {
        Ok(self.read()?.host_list(host_id))
    }

    async fn list_host_installed_paths(&self, host_id: HostId) -> Result<Vec<InstalledPath>> {
        let inner = self.read()?;
        Ok(inner
            .paths
            .get(&host_id)
            .map(|paths| paths.iter().map(|p| p.path.clone()).collect())
            .unwrap_or_default())
    }

    async fn count_software(&self) -> Result<i64> {
        Ok(self.read()?.catalog.len() as i64)
    }
}
