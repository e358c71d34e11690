// src/main.rs

//! The main entry point for the pxypool daemon.

use anyhow::Result;
use pxypool::config::Config;
use pxypool::server;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("PXYPOOL_BUILD_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("pxypool version {VERSION}");
        return Ok(());
    }

    // The configuration path can be provided via a --config flag; otherwise
    // it defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml")
        .to_string();

    let mut config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Override the core count if provided as a command-line argument.
    if let Some(idx) = args.iter().position(|arg| arg == "--cpu-cores") {
        match args.get(idx + 1).map(|s| s.parse::<usize>()) {
            Some(Ok(n)) if n > 0 => config.cpu_cores = n,
            Some(_) => {
                eprintln!("--cpu-cores requires a positive integer");
                std::process::exit(1);
            }
            None => {
                eprintln!("--cpu-cores flag requires a value");
                std::process::exit(1);
            }
        }
    }

    // Get initial log level from env var or config.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    // Create a reloadable filter layer.
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_thread_names(true),
        )
        .init();

    info!(
        "pxypool {} starting with {} workers ({} cores)",
        VERSION,
        config.worker_count(),
        config.cpu_cores
    );

    if let Err(e) = server::run(config, config_path, Arc::new(reload_handle)).await {
        error!("Server runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
