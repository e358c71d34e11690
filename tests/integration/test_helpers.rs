// tests/integration/test_helpers.rs

//! Test helpers and utilities shared by the pool tests

#![allow(dead_code)]

use pxypool::ThreadPool;
use pxypool::config::Config;
use pxypool::connection::{ConnectionRecord, Descriptors};
use pxypool::core::TeardownError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Set up minimal tracing for tests (ignores the error if already initialized).
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A config sized for `cores` CPU cores, with a sweep interval long enough
/// that the background timer never fires during a test.
pub fn test_config(cores: usize) -> Config {
    let mut config = Config::default();
    config.cpu_cores = cores;
    config.pool.sweep_interval = Duration::from_secs(3600);
    config.pool.expire_after = Duration::from_secs(30);
    config
}

/// A started pool with `2 * cores` workers.
pub fn running_pool(cores: usize) -> ThreadPool {
    init_tracing();
    let mut pool = ThreadPool::new(Arc::new(test_config(cores)));
    pool.run().expect("Failed to start thread pool");
    pool
}

/// Counts teardown callbacks across every record created through it.
#[derive(Clone, Default)]
pub struct TeardownCounter {
    count: Arc<AtomicUsize>,
}

impl TeardownCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// A fresh record whose teardown bumps this counter.
    pub fn record(&self) -> Arc<ConnectionRecord> {
        let count = self.count.clone();
        Arc::new(
            ConnectionRecord::new(Descriptors::pair(10, 11), Some(dest_addr())).with_teardown(
                move |_: &ConnectionRecord| -> Result<(), TeardownError> {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ),
        )
    }
}

/// A record with no teardown callback.
pub fn plain_record() -> Arc<ConnectionRecord> {
    Arc::new(ConnectionRecord::new(Descriptors::pair(3, 4), None))
}

pub fn dest_addr() -> SocketAddr {
    "192.0.2.10:443".parse().unwrap()
}
