// src/core/metrics.rs

//! Defines and registers Prometheus metrics for pool monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, GaugeVec, TextEncoder, register_counter, register_gauge, register_gauge_vec,
};

lazy_static! {
    // --- Gauges ---
    /// Current load of each worker, labeled by worker index.
    pub static ref WORKER_LOAD: GaugeVec =
        register_gauge_vec!("pxypool_worker_load", "Connections currently assigned to a worker.", &["worker"]).unwrap();
    /// The number of worker event loops currently dispatching.
    pub static ref WORKERS_RUNNING: Gauge =
        register_gauge!("pxypool_workers_running", "Number of worker event loops currently running.").unwrap();

    // --- Counters ---
    /// Connections handed to a worker, children included.
    pub static ref CONNECTIONS_ATTACHED_TOTAL: Counter =
        register_counter!("pxypool_connections_attached_total", "Total number of connections attached to a worker.").unwrap();
    /// Connections whose load slot was freed by a detach.
    pub static ref CONNECTIONS_DETACHED_TOTAL: Counter =
        register_counter!("pxypool_connections_detached_total", "Total number of connections detached from a worker.").unwrap();
    /// Records reaped by the expiration sweep.
    pub static ref CONNECTIONS_EXPIRED_TOTAL: Counter =
        register_counter!("pxypool_connections_expired_total", "Total number of connections torn down for idleness.").unwrap();
    /// Teardown callbacks that failed or panicked.
    pub static ref TEARDOWN_FAILURES_TOTAL: Counter =
        register_counter!("pxypool_teardown_failures_total", "Total number of failed connection teardowns.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
