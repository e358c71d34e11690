// src/server/mod.rs

//! Process glue around the worker pool: startup, the metrics endpoint,
//! signal handling and orderly shutdown.

use crate::config::Config;
use crate::core::pool::ThreadPool;
use crate::core::userdb::SqliteUserDb;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

mod metrics_server;

pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Starts the pool and keeps it running until SIGINT or SIGTERM.
///
/// SIGHUP re-reads `log_level` from `config_path`; SIGUSR1 logs the status
/// of every worker.
pub async fn run(
    config: Config,
    config_path: String,
    log_reload_handle: LogReloadHandle,
) -> Result<()> {
    let config = Arc::new(config);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 1. Start the workers. `run` blocks until every worker is dispatching.
    let mut pool = ThreadPool::new(config.clone());
    if config.has_user_auth() {
        pool = pool.with_user_db(Arc::new(SqliteUserDb::new(&config.user_auth.db_path)));
    }
    let pool = tokio::task::spawn_blocking(move || {
        let mut pool = pool;
        pool.run().map(|()| pool)
    })
    .await
    .context("thread pool startup task failed")?
    .context("failed to start thread pool")?;

    // 2. Optional metrics endpoint.
    let metrics_task = config.metrics.enabled.then(|| {
        tokio::spawn(metrics_server::run_metrics_server(
            config.metrics.port,
            shutdown_tx.subscribe(),
        ))
    });

    // 3. Wait for a signal.
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow!("Failed to register SIGHUP handler: {}", e))?;
    let mut sigusr1 = signal(SignalKind::user_defined1())
        .map_err(|e| anyhow!("Failed to register SIGUSR1 handler: {}", e))?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = sighup.recv() => reload_log_level(&config_path, &log_reload_handle),
            _ = sigusr1.recv() => info!("Pool status:\n{}", pool.status()),
        }
    }

    // 4. Tear down.
    info!("Shutting down. Sending signal to all tasks.");
    if shutdown_tx.send(()).is_err() {
        warn!("No background task was listening for the shutdown signal.");
    }

    let report = tokio::task::spawn_blocking(move || pool.free())
        .await
        .context("thread pool shutdown task failed")?;
    if report.failed > 0 {
        error!(
            "{} connections could not be released cleanly during shutdown",
            report.failed
        );
    }

    if let Some(task) = metrics_task
        && let Err(e) = task.await
    {
        error!("Metrics server task failed: {e:?}");
    }

    info!("Shutdown complete.");
    Ok(())
}

fn reload_log_level(config_path: &str, handle: &LogReloadHandle) {
    let level = match Config::from_file(config_path) {
        Ok(config) => config.log_level,
        Err(e) => {
            warn!("SIGHUP: keeping current log level, config reload failed: {:#}", e);
            return;
        }
    };
    match handle.reload(EnvFilter::new(&level)) {
        Ok(()) => info!("SIGHUP: log level set to '{}'", level),
        Err(e) => warn!("SIGHUP: failed to apply log level '{}': {}", level, e),
    }
}
