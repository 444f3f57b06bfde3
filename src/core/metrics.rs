// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Server-wide Gauges ---
    /// The number of connections currently tracked by the registry.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("fcgi_connected_clients", "Number of currently open FastCGI connections.").unwrap();


    // --- Server-wide Counters ---
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("fcgi_connections_received_total", "Total number of connections received.").unwrap();
    /// Closed connections, labeled by how they closed (`normal` or `abrupt`).
    pub static ref CONNECTIONS_CLOSED_TOTAL: CounterVec =
        register_counter_vec!("fcgi_connections_closed_total", "Total number of closed connections, labeled by closure kind.", &["kind"]).unwrap();
    /// The total number of records decoded and routed.
    pub static ref RECORDS_PROCESSED_TOTAL: Counter =
        register_counter!("fcgi_records_processed_total", "Total number of records processed.").unwrap();
    /// Records that forced a connection closed.
    pub static ref INVALID_RECORDS_TOTAL: Counter =
        register_counter!("fcgi_invalid_records_total", "Total number of invalid records received.").unwrap();
    /// Failures returned or raised by application handlers.
    pub static ref HANDLER_FAULTS_TOTAL: Counter =
        register_counter!("fcgi_handler_faults_total", "Total number of handler faults.").unwrap();
    /// Unclassified faults caught at the reactor boundary.
    pub static ref REACTOR_FAULTS_TOTAL: Counter =
        register_counter!("fcgi_reactor_faults_total", "Total number of unexpected faults caught by the reactor.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}
