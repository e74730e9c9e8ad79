//! # Software ingestion CLI (`swingest`)
//!
//! ## Usage
//!
//! ```bash
//! swingest --config ./config/swingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `swingest init` | Create the SQLite database and schema |
//! | `swingest ingest <file.json> --host-id N --platform P` | Ingest one report from a file |
//! | `swingest sweep` | Remove catalog rows no host references |
//! | `swingest serve` | Run the processor, the sweeper and the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! swingest init --config ./config/swingest.toml
//!
//! # Agent report: a JSON array of string-valued rows
//! swingest ingest ./report.json --host-id 12 --platform darwin
//!
//! # MDM report: a JSON array of software entries
//! swingest ingest ./apps.json --host-id 40 --platform ios --mdm
//!
//! swingest serve --config ./config/swingest.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use software_ingestion::clock::system_clock;
use software_ingestion::config::{self, Config};
use software_ingestion::load::LoadManagedService;
use software_ingestion::models::{HostId, HostMetadata, RawRow, ReportPayload, Software};
use software_ingestion::processor::AsyncProcessor;
use software_ingestion::service::{kind_label, IngestionService};
use software_ingestion::sqlite_store::SqliteStore;
use software_ingestion::store::SoftwareStore;
use software_ingestion::sweep::{spawn_sweeper, sweep_once};
use software_ingestion::tracker::IngestionTracker;
use software_ingestion::{db, migrate, server};

/// Host software ingestion pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "swingest",
    about = "Host software ingestion pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/swingest.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest one report read from a JSON file.
    ///
    /// Agent reports are arrays of objects with string fields (`name`,
    /// `version`, `source`, `installed_path`, ...). With `--mdm` the file
    /// holds structured software entries instead.
    Ingest {
        file: PathBuf,

        #[arg(long)]
        host_id: HostId,

        #[arg(long)]
        platform: String,

        #[arg(long)]
        hostname: Option<String>,

        /// Treat the file as an MDM report.
        #[arg(long)]
        mdm: bool,
    },

    /// Delete catalog rows that no host references.
    Sweep,

    /// Serve the HTTP API until interrupted.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            host_id,
            platform,
            hostname,
            mdm,
        } => {
            let host = HostMetadata { platform, hostname };
            run_ingest(&cfg, &file, host_id, host, mdm).await?;
        }
        Commands::Sweep => {
            let pool = db::connect(&cfg).await?;
            let store = SqliteStore::new(pool.clone(), cfg.ingestion.min_last_opened_at_diff());
            let report = sweep_once(&store, None).await?;
            println!("sweep");
            println!("  orphans removed: {}", report.orphans_removed);
            pool.close().await;
        }
        Commands::Serve => {
            run_serve(&cfg).await?;
        }
    }

    Ok(())
}

fn read_payload(file: &Path, mdm: bool) -> anyhow::Result<ReportPayload> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read report {}", file.display()))?;
    let payload = if mdm {
        let software: Vec<Software> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid MDM report in {}", file.display()))?;
        ReportPayload::Mdm(software)
    } else {
        let rows: Vec<RawRow> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid agent report in {}", file.display()))?;
        ReportPayload::Agent(rows)
    };
    Ok(payload)
}

async fn run_ingest(
    cfg: &Config,
    file: &Path,
    host_id: HostId,
    host: HostMetadata,
    mdm: bool,
) -> anyhow::Result<()> {
    let payload = read_payload(file, mdm)?;

    let pool = db::connect(cfg).await?;
    let store = Arc::new(SqliteStore::new(pool.clone(), cfg.ingestion.min_last_opened_at_diff()));
    let load = LoadManagedService::new(IngestionService::new(store), &cfg.ingestion, system_clock());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = load.handle(host_id, &host, &payload, &cancel, None).await?;
    pool.close().await;

    println!("ingest host {} ({})", host_id, kind_label(payload.kind()));
    println!("  software:        {}", outcome.software);
    println!("  installed paths: {}", outcome.installed_paths);
    println!("  dropped rows:    {}", outcome.dropped);
    println!("  inserted:        {}", outcome.inserted);
    println!("  removed:         {}", outcome.deleted);
    Ok(())
}

async fn run_serve(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;

    let clock = system_clock();
    let store: Arc<dyn SoftwareStore> =
        Arc::new(SqliteStore::new(pool.clone(), cfg.ingestion.min_last_opened_at_diff()));
    let tracker = Arc::new(IngestionTracker::new(&cfg.tracking, clock.clone()));
    let service = IngestionService::new(store.clone()).with_tracker(tracker.clone());
    let load = Arc::new(LoadManagedService::new(service, &cfg.ingestion, clock));
    let processor = Arc::new(AsyncProcessor::start(load, &cfg.ingestion));

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        store,
        Some(tracker.clone()),
        cfg.tracking.sweep_interval(),
        shutdown.clone(),
    );

    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            on_interrupt.cancel();
        }
    });

    let served = server::run_server(cfg, processor.clone(), tracker, shutdown.clone()).await;

    shutdown.cancel();
    processor.shutdown().await;
    if let Err(err) = sweeper.await {
        tracing::warn!(%err, "sweeper ended abnormally");
    }
    pool.close().await;

    served
}
