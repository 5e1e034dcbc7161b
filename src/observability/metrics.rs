//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define connection metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `rdp_connections_accepted_total` (counter): connections admitted
//! - `rdp_connections_declined_total` (counter): accepts dropped at capacity
//! - `rdp_connections_closed_total` (counter): closes, by reason
//! - `rdp_accept_errors_total` (counter): failed accepts, by reason
//! - `rdp_active_connections` (gauge): registered connections
//!
//! # Design Decisions
//! - Low-overhead metric updates; without an installed exporter the calls
//!   are no-ops, so tests need no setup

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const CONNECTIONS_ACCEPTED: &str = "rdp_connections_accepted_total";
pub const CONNECTIONS_DECLINED: &str = "rdp_connections_declined_total";
pub const CONNECTIONS_CLOSED: &str = "rdp_connections_closed_total";
pub const ACTIVE_CONNECTIONS: &str = "rdp_active_connections";
pub const ACCEPT_ERRORS: &str = "rdp_accept_errors_total";

/// Install the Prometheus exporter listening on `addr`.
///
/// Must run inside a Tokio runtime. Failure is logged, not fatal.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    metrics::counter!(CONNECTIONS_ACCEPTED).increment(1);
}

pub fn record_connection_declined() {
    metrics::counter!(CONNECTIONS_DECLINED).increment(1);
}

pub fn record_connection_closed(reason: &'static str) {
    metrics::counter!(CONNECTIONS_CLOSED, "reason" => reason).increment(1);
}

pub fn record_accept_error(reason: &'static str) {
    metrics::counter!(ACCEPT_ERRORS, "reason" => reason).increment(1);
}

pub fn set_active_connections(count: usize) {
    metrics::gauge!(ACTIVE_CONNECTIONS).set(count as f64);
}
