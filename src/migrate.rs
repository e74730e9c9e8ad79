use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the catalog, host mapping, and installed-path tables. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Catalog: one row per identity tuple, keyed by its checksum
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS software (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL,
            vendor TEXT NOT NULL DEFAULT '',
            bundle_identifier TEXT NOT NULL DEFAULT '',
            release TEXT NOT NULL DEFAULT '',
            arch TEXT NOT NULL DEFAULT '',
            extension_id TEXT NOT NULL DEFAULT '',
            extension_for TEXT NOT NULL DEFAULT '',
            is_kernel INTEGER NOT NULL DEFAULT 0,
            checksum TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(checksum)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS host_software (
            host_id INTEGER NOT NULL,
            software_id INTEGER NOT NULL,
            last_opened_at INTEGER,
            PRIMARY KEY (host_id, software_id),
            FOREIGN KEY (software_id) REFERENCES software(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS host_software_installed_paths (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            host_id INTEGER NOT NULL,
            software_id INTEGER NOT NULL,
            installed_path TEXT NOT NULL,
            team_identifier TEXT NOT NULL DEFAULT '',
            cdhash_sha256 TEXT NOT NULL DEFAULT '',
            UNIQUE(host_id, software_id, installed_path, team_identifier, cdhash_sha256),
            FOREIGN KEY (software_id) REFERENCES software(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Host updates bookkeeping
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS host_updates (
            host_id INTEGER PRIMARY KEY,
            software_updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_host_software_software_id ON host_software(software_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_installed_paths_host_id ON host_software_installed_paths(host_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_software_source ON software(source)")
        .execute(pool)
        .await?;

    Ok(())
}
