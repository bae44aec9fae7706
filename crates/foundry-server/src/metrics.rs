//! Metrics collection and export for foundry.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "foundry_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "foundry_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "foundry_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "foundry_messages_total";
    pub const MESSAGES_BYTES: &str = "foundry_messages_bytes";
    pub const PATCHES_TOTAL: &str = "foundry_patches_total";
    pub const BROADCAST_RECIPIENTS: &str = "foundry_broadcast_recipients";
    pub const LATENCY_SECONDS: &str = "foundry_latency_seconds";
    pub const ERRORS_TOTAL: &str = "foundry_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(
        names::PATCHES_TOTAL,
        "Machine patches received, by outcome (applied or ignored)"
    );
    metrics::describe_histogram!(
        names::BROADCAST_RECIPIENTS,
        "Observers a machine update was queued to"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound message processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at the limit.
pub fn record_rejection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a patch outcome.
pub fn record_patch(applied: bool) {
    let outcome = if applied { "applied" } else { "ignored" };
    counter!(names::PATCHES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record how many observers an update was queued to.
pub fn record_recipients(count: usize) {
    histogram!(names::BROADCAST_RECIPIENTS).record(count as f64);
}

/// Record message latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
