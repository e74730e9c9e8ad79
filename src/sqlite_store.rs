//! SQLite-backed [`SoftwareStore`] implementation.
//!
//! Each host replacement runs in one transaction. The transaction first
//! touches the host's `host_updates` row so that it holds SQLite's write
//! lock before it reads the current set; concurrent replacements for the
//! same host therefore serialize instead of computing deltas from a stale
//! snapshot. A full report replaces software and installed paths inside a
//! single transaction, so a failure or a dropped future commits neither.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::models::{HostId, InstalledPath, Software};
use crate::store::{
    ensure_mutation_current, installed_paths_delta, nothing_changed, should_refresh_last_opened,
    MutationResult, SoftwareStore, StoredPath,
};

/// SQLite implementation of the [`SoftwareStore`] trait.
///
/// Wraps a [`SqlitePool`] and translates every method into statements
/// against `software`, `host_software`, `host_software_installed_paths`
/// and `host_updates`.
pub struct SqliteStore {
    pool: SqlitePool,
    min_last_opened_at_diff: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, min_last_opened_at_diff: Duration) -> Self {
        Self {
            pool,
            min_last_opened_at_diff,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_epoch(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp())
}

fn software_from_row(row: &SqliteRow) -> Result<Software> {
    let last_opened: Option<i64> = row.try_get("last_opened_at")?;
    Ok(Software {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        source: row.try_get("source")?,
        vendor: row.try_get("vendor")?,
        bundle_identifier: row.try_get("bundle_identifier")?,
        release: row.try_get("release")?,
        arch: row.try_get("arch")?,
        extension_id: row.try_get("extension_id")?,
        extension_for: row.try_get("extension_for")?,
        last_opened_at: last_opened.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        is_kernel: row.try_get("is_kernel")?,
    })
}

async fn load_host_software(conn: &mut SqliteConnection, host_id: HostId) -> Result<Vec<Software>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.name, s.version, s.source, s.vendor, s.bundle_identifier,
               s.release, s.arch, s.extension_id, s.extension_for, s.is_kernel,
               hs.last_opened_at
        FROM host_software hs
        JOIN software s ON s.id = hs.software_id
        WHERE hs.host_id = ?
        ORDER BY s.id
        "#,
    )
    .bind(host_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(software_from_row).collect()
}

async fn load_host_paths(conn: &mut SqliteConnection, host_id: HostId) -> Result<Vec<StoredPath>> {
    let rows = sqlx::query(
        r#"
        SELECT id, host_id, software_id, installed_path, team_identifier, cdhash_sha256
        FROM host_software_installed_paths
        WHERE host_id = ?
        ORDER BY id
        "#,
    )
    .bind(host_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(StoredPath {
                id: row.try_get("id")?,
                path: InstalledPath {
                    host_id: row.try_get("host_id")?,
                    software_id: row.try_get("software_id")?,
                    installed_path: row.try_get("installed_path")?,
                    team_identifier: row.try_get("team_identifier")?,
                    cdhash_sha256: row.try_get("cdhash_sha256")?,
                },
            })
        })
        .collect()
}

/// Insert a catalog row unless one with the same checksum exists, and
/// return the row's id either way.
async fn ensure_catalog_row(conn: &mut SqliteConnection, software: &Software) -> Result<i64> {
    let checksum = software.checksum();
    sqlx::query(
        r#"
        INSERT INTO software (name, version, source, vendor, bundle_identifier,
                              release, arch, extension_id, extension_for,
                              is_kernel, checksum, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(checksum) DO NOTHING
        "#,
    )
    .bind(&software.name)
    .bind(&software.version)
    .bind(&software.source)
    .bind(&software.vendor)
    .bind(&software.bundle_identifier)
    .bind(&software.release)
    .bind(&software.arch)
    .bind(&software.extension_id)
    .bind(&software.extension_for)
    .bind(software.is_kernel)
    .bind(&checksum)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM software WHERE checksum = ?")
        .bind(&checksum)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("catalog row for {:?} missing after insert", software.name))?;
    Ok(id)
}

/// Take SQLite's write lock for the enclosing transaction before anything
/// is read. Matches no row for a host seen for the first time.
async fn lock_host(conn: &mut SqliteConnection, host_id: HostId) -> Result<()> {
    sqlx::query("UPDATE host_updates SET software_updated_at = software_updated_at WHERE host_id = ?")
        .bind(host_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn replace_software_in(
    conn: &mut SqliteConnection,
    host_id: HostId,
    software: &[Software],
    min_last_opened_at_diff: Duration,
) -> Result<MutationResult> {
    let current = load_host_software(conn, host_id).await?;
    if nothing_changed(&current, software, min_last_opened_at_diff) {
        return Ok(MutationResult::new(current, Vec::new(), Vec::new()));
    }

    sqlx::query(
        r#"
        INSERT INTO host_updates (host_id, software_updated_at) VALUES (?, ?)
        ON CONFLICT(host_id) DO UPDATE SET software_updated_at = excluded.software_updated_at
        "#,
    )
    .bind(host_id)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    let current_map: HashMap<String, &Software> =
        current.iter().map(|s| (s.unique_str(), s)).collect();
    let incoming_map: HashMap<String, &Software> =
        software.iter().map(|s| (s.unique_str(), s)).collect();

    let deleted: Vec<Software> = current
        .iter()
        .filter(|s| !incoming_map.contains_key(&s.unique_str()))
        .cloned()
        .collect();

    for s in &deleted {
        sqlx::query("DELETE FROM host_software_installed_paths WHERE host_id = ? AND software_id = ?")
            .bind(host_id)
            .bind(s.id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM host_software WHERE host_id = ? AND software_id = ?")
            .bind(host_id)
            .bind(s.id)
            .execute(&mut *conn)
            .await?;
    }

    let mut keys: Vec<&String> = incoming_map.keys().collect();
    keys.sort();

    let mut inserted = Vec::new();
    for key in keys {
        let new_sw = incoming_map[key];
        match current_map.get(key) {
            None => {
                let id = ensure_catalog_row(conn, new_sw).await?;
                sqlx::query(
                    "INSERT INTO host_software (host_id, software_id, last_opened_at) VALUES (?, ?, ?)",
                )
                .bind(host_id)
                .bind(id)
                .bind(to_epoch(new_sw.last_opened_at))
                .execute(&mut *conn)
                .await?;
                inserted.push(Software {
                    id,
                    ..new_sw.clone()
                });
            }
            Some(cur) => {
                if should_refresh_last_opened(cur, new_sw, min_last_opened_at_diff) {
                    sqlx::query(
                        "UPDATE host_software SET last_opened_at = ? WHERE host_id = ? AND software_id = ?",
                    )
                    .bind(to_epoch(new_sw.last_opened_at))
                    .bind(host_id)
                    .bind(cur.id)
                    .execute(&mut *conn)
                    .await?;
                }
            }
        }
    }

    Ok(MutationResult::new(current, inserted, deleted))
}

async fn replace_paths_in(
    conn: &mut SqliteConnection,
    host_id: HostId,
    reported: &BTreeSet<String>,
    host_software: &[Software],
) -> Result<()> {
    let stored = load_host_paths(conn, host_id).await?;
    let (to_insert, to_delete) = installed_paths_delta(host_id, reported, &stored, host_software)?;

    for id in to_delete {
        sqlx::query("DELETE FROM host_software_installed_paths WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    for path in &to_insert {
        sqlx::query(
            r#"
            INSERT INTO host_software_installed_paths
                (host_id, software_id, installed_path, team_identifier, cdhash_sha256)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(path.host_id)
        .bind(path.software_id)
        .bind(&path.installed_path)
        .bind(&path.team_identifier)
        .bind(&path.cdhash_sha256)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl SoftwareStore for SqliteStore {
    async fn replace_host_software(
        &self,
        host_id: HostId,
        software: &[Software],
    ) -> Result<MutationResult> {
        let mut tx = self.pool.begin().await?;
        lock_host(&mut tx, host_id).await?;
        let mutation =
            replace_software_in(&mut tx, host_id, software, self.min_last_opened_at_diff).await?;
        tx.commit().await?;
        Ok(mutation)
    }

    async fn replace_host_installed_paths(
        &self,
        host_id: HostId,
        reported: &BTreeSet<String>,
        mutation: &MutationResult,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_host(&mut tx, host_id).await?;

        let host_software = load_host_software(&mut tx, host_id).await?;
        ensure_mutation_current(host_id, mutation, &host_software)?;
        replace_paths_in(&mut tx, host_id, reported, &host_software).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn replace_host_report(
        &self,
        host_id: HostId,
        software: &[Software],
        reported: &BTreeSet<String>,
    ) -> Result<MutationResult> {
        let mut tx = self.pool.begin().await?;
        lock_host(&mut tx, host_id).await?;

        let mutation =
            replace_software_in(&mut tx, host_id, software, self.min_last_opened_at_diff).await?;
        replace_paths_in(&mut tx, host_id, reported, &mutation.current_installed()).await?;

        tx.commit().await?;
        Ok(mutation)
    }

    async fn cleanup_orphan_software(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM software
            WHERE NOT EXISTS (SELECT 1 FROM host_software hs WHERE hs.software_id = software.id)
              AND NOT EXISTS (
                  SELECT 1 FROM host_software_installed_paths p WHERE p.software_id = software.id
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_host_software(&self, host_id: HostId) -> Result<Vec<Software>> {
        let mut conn = self.pool.acquire().await?;
        load_host_software(&mut conn, host_id).await
    }

    async fn list_host_installed_paths(&self, host_id: HostId) -> Result<Vec<InstalledPath>> {
        let mut conn = self.pool.acquire().await?;
        Ok(load_host_paths(&mut conn, host_id)
            .await?
            .into_iter()
            .map(|p| p.path)
            .collect())
    }

    async fn count_software(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM software")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
