//! Metrics collection and exposition.
//!
//! # Metrics
//! - `h1_connections_active` (gauge): sockets currently served
//! - `h1_requests_total` (counter): requests by method
//! - `h1_responses_total` (counter): responses by status class
//! - `h1_parse_errors_total` (counter): malformed heads by side
//! - `h1_pool_requests_total` (counter): agent lookups by outcome
//! - `h1_pool_free_sockets` (gauge): idle sockets held by agents
//!
//! # Design Decisions
//! - Updates go through the `metrics` facade; with no recorder installed
//!   they are no-ops
//! - The Prometheus exporter is only installed by the binary

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const CONNECTIONS_ACTIVE: &str = "h1_connections_active";
pub const REQUESTS_TOTAL: &str = "h1_requests_total";
pub const RESPONSES_TOTAL: &str = "h1_responses_total";
pub const PARSE_ERRORS_TOTAL: &str = "h1_parse_errors_total";
pub const POOL_REQUESTS_TOTAL: &str = "h1_pool_requests_total";
pub const POOL_FREE_SOCKETS: &str = "h1_pool_free_sockets";

/// Which end of a connection observed something.
#[derive(Debug, Clone, Copy)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Server => "server",
            Side::Client => "client",
        }
    }
}

pub fn inc_connections() {
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn dec_connections() {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_request(method: &str) {
    counter!(REQUESTS_TOTAL, "method" => method.to_string()).increment(1);
}

/// Count a finished response under its status class (`2xx`, `4xx`, ...).
pub fn record_response(status: u16) {
    let class = match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    counter!(RESPONSES_TOTAL, "class" => class).increment(1);
}

pub fn record_parse_error(side: Side) {
    counter!(PARSE_ERRORS_TOTAL, "side" => side.as_str()).increment(1);
}

/// `hit` when a free socket was reused, `miss` when a new one was opened.
pub fn record_pool_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(POOL_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn inc_free_sockets() {
    gauge!(POOL_FREE_SOCKETS).increment(1.0);
}

pub fn dec_free_sockets() {
    gauge!(POOL_FREE_SOCKETS).decrement(1.0);
}

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_harmless() {
        inc_connections();
        record_request("GET");
        record_response(204);
        record_response(599);
        record_parse_error(Side::Client);
        record_pool_lookup(true);
        inc_free_sockets();
        dec_free_sockets();
        dec_connections();
    }
}
