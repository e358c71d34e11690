// src/config.rs

//! Manages pool configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use sysinfo::System;
use tracing::{info, warn};

/// Timing of the per-worker timer that drives the expiration sweep.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// How often each worker runs an expiration pass.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Connections idle for longer than this are torn down by the sweep.
    #[serde(with = "humantime_serde", default = "default_expire_after")]
    pub expire_after: Duration,
    /// The worker logs its status once the tick counter exceeds this value.
    #[serde(default = "default_status_every_ticks")]
    pub status_every_ticks: u32,
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_expire_after() -> Duration {
    Duration::from_secs(30)
}
fn default_status_every_ticks() -> u32 {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            expire_after: default_expire_after(),
            status_every_ticks: default_status_every_ticks(),
        }
    }
}

/// Whether any proxy destination is given by name and needs asynchronous resolution.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Configuration for user-authentication lookups.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// The SQLite database holding the `users` table.
    #[serde(default = "default_user_db_path")]
    pub db_path: String,
}

fn default_user_db_path() -> String {
    "pxypool_data/users.db".to_string()
}

impl Default for UserAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_user_db_path(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8879
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cpu_cores: Option<usize>,
    #[serde(default)]
    pool: PoolConfig,
    #[serde(default)]
    dns: DnsConfig,
    #[serde(default)]
    user_auth: UserAuthConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated, and resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    /// The number of CPU cores the pool is sized for. Always resolved.
    pub cpu_cores: usize,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub user_auth: UserAuthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cpu_cores: detect_cpu_cores(),
            pool: PoolConfig::default(),
            dns: DnsConfig::default(),
            user_auth: UserAuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Counts the online CPUs, falling back to the standard library and then to one.
pub fn detect_cpu_cores() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    let cpus = sys.cpus().len();
    if cpus > 0 {
        return cpus;
    }
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            warn!("Could not detect the number of CPU cores ({}); assuming 1", e);
            1
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file '{path}'"))
    }

    /// Parses, resolves and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw_config: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;

        let cpu_cores = match raw_config.cpu_cores {
            Some(0) => return Err(anyhow!("cpu_cores cannot be 0")),
            Some(n) => n,
            None => {
                let detected = detect_cpu_cores();
                info!("Detected {} CPU cores", detected);
                detected
            }
        };

        let config = Config {
            log_level: raw_config.log_level,
            cpu_cores,
            pool: raw_config.pool,
            dns: raw_config.dns,
            user_auth: raw_config.user_auth,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_cores == 0 {
            return Err(anyhow!("cpu_cores cannot be 0"));
        }
        if self.pool.sweep_interval.is_zero() {
            return Err(anyhow!("pool.sweep_interval cannot be 0"));
        }
        if self.pool.expire_after.is_zero() {
            return Err(anyhow!("pool.expire_after cannot be 0"));
        }
        if self.pool.expire_after < self.pool.sweep_interval {
            warn!(
                "pool.expire_after ({:?}) is shorter than pool.sweep_interval ({:?}); idle connections live up to one sweep interval longer than configured",
                self.pool.expire_after, self.pool.sweep_interval
            );
        }
        if self.user_auth.enabled && self.user_auth.db_path.trim().is_empty() {
            return Err(anyhow!(
                "user_auth.db_path cannot be empty when user_auth is enabled"
            ));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }

    /// The fixed size of the worker pool: two workers per core.
    pub fn worker_count(&self) -> usize {
        self.cpu_cores.max(1) * 2
    }

    pub fn dns_enabled(&self) -> bool {
        self.dns.enabled
    }

    pub fn has_user_auth(&self) -> bool {
        self.user_auth.enabled
    }
}
