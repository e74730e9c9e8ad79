use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/software.sqlite"),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

/// Load management and async admission settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_hosts")]
    pub max_concurrent_hosts: usize,
    #[serde(default = "default_database_timeout_secs")]
    pub database_timeout_secs: u64,
    #[serde(default = "default_async_queue_size")]
    pub async_queue_size: usize,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Smallest `last_opened_at` advance worth writing back.
    #[serde(default = "default_min_last_opened_at_diff_secs")]
    pub min_last_opened_at_diff_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_max_requests_per_second(),
            burst_size: default_burst_size(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            batch_size: default_batch_size(),
            max_concurrent_hosts: default_max_concurrent_hosts(),
            database_timeout_secs: default_database_timeout_secs(),
            async_queue_size: default_async_queue_size(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            min_last_opened_at_diff_secs: default_min_last_opened_at_diff_secs(),
        }
    }
}

fn default_max_requests_per_second() -> f64 {
    50.0
}
fn default_burst_size() -> u32 {
    100
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    10
}
fn default_max_concurrent_hosts() -> usize {
    20
}
fn default_database_timeout_secs() -> u64 {
    10
}
fn default_async_queue_size() -> usize {
    1000
}
fn default_dispatch_interval_ms() -> u64 {
    100
}
fn default_min_last_opened_at_diff_secs() -> u64 {
    1
}

impl IngestionConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn database_timeout(&self) -> Duration {
        Duration::from_secs(self.database_timeout_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn min_last_opened_at_diff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_last_opened_at_diff_secs as i64)
    }
}

/// Per-host cadence tracking settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_expected_interval_mins")]
    pub expected_interval_mins: u64,
    #[serde(default = "default_alert_threshold_mins")]
    pub alert_threshold_mins: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_history_window_hours")]
    pub history_window_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            expected_interval_mins: default_expected_interval_mins(),
            alert_threshold_mins: default_alert_threshold_mins(),
            retention_days: default_retention_days(),
            history_window_hours: default_history_window_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_expected_interval_mins() -> u64 {
    60
}
fn default_alert_threshold_mins() -> u64 {
    90
}
fn default_retention_days() -> u64 {
    7
}
fn default_history_window_hours() -> u64 {
    24
}
fn default_sweep_interval_secs() -> u64 {
    3600
}

impl TrackingConfig {
    pub fn expected_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.expected_interval_mins as i64)
    }

    pub fn alert_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.alert_threshold_mins as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.history_window_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8412".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let ing = &config.ingestion;

    if ing.max_requests_per_second.is_nan() || ing.max_requests_per_second <= 0.0 {
        anyhow::bail!("ingestion.max_requests_per_second must be > 0");
    }
    if ing.burst_size == 0 {
        anyhow::bail!("ingestion.burst_size must be > 0");
    }
    if ing.failure_threshold == 0 {
        anyhow::bail!("ingestion.failure_threshold must be > 0");
    }
    if ing.batch_size == 0 {
        anyhow::bail!("ingestion.batch_size must be > 0");
    }
    if ing.max_concurrent_hosts == 0 {
        anyhow::bail!("ingestion.max_concurrent_hosts must be > 0");
    }
    if ing.async_queue_size == 0 {
        anyhow::bail!("ingestion.async_queue_size must be > 0");
    }
    if ing.database_timeout_secs == 0 {
        anyhow::bail!("ingestion.database_timeout_secs must be > 0");
    }
    if ing.dispatch_interval_ms == 0 {
        anyhow::bail!("ingestion.dispatch_interval_ms must be > 0");
    }

    let tr = &config.tracking;
    if tr.alert_threshold_mins <= tr.expected_interval_mins {
        anyhow::bail!(
            "tracking.alert_threshold_mins ({}) must exceed tracking.expected_interval_mins ({})",
            tr.alert_threshold_mins,
            tr.expected_interval_mins
        );
    }
    if tr.history_window_hours == 0 {
        anyhow::bail!("tracking.history_window_hours must be > 0");
    }
    if tr.retention() < tr.history_window() {
        anyhow::bail!("tracking.retention_days must cover tracking.history_window_hours");
    }
    if tr.sweep_interval_secs == 0 {
        anyhow::bail!("tracking.sweep_interval_secs must be > 0");
    }

    Ok(())
}
