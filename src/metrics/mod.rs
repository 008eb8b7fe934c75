//! Prometheus metrics for the broadcast engine.
//!
//! The surface an external collector scrapes:
//! - connection-count gauge
//! - messages-sent counter (by room)
//! - broadcast-latency histogram (by room)
//! - errors counter (by kind)
//! plus open/close counters and liveness bookkeeping.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "flux";

lazy_static! {
    /// Number of currently registered connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of currently registered connections"
    ).unwrap();

    /// Connections admitted since start
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections admitted"
    ).unwrap();

    /// Connections removed since start
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections removed"
    ).unwrap();

    /// Rooms with at least one member
    pub static ref ROOMS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_rooms_active", METRIC_PREFIX),
        "Number of rooms with at least one member"
    ).unwrap();

    /// Messages fanned out, labelled by room
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total messages enqueued to room members",
        &["room"]
    ).unwrap();

    /// Messages accepted from clients, labelled by kind
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total inbound messages accepted",
        &["kind"]
    ).unwrap();

    /// Broadcast fan-out latency, labelled by room
    pub static ref BROADCAST_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_broadcast_latency_seconds", METRIC_PREFIX),
        "Broadcast fan-out latency in seconds",
        &["room"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    /// Errors by taxonomy kind
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_errors_total", METRIC_PREFIX),
        "Total engine errors",
        &["kind"]
    ).unwrap();

    /// Connections force-closed by the liveness monitor
    pub static ref HEARTBEAT_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeat_timeouts_total", METRIC_PREFIX),
        "Total connections closed for missed heartbeat acknowledgments"
    ).unwrap();

    /// Connections force-closed by the idle detector
    pub static ref IDLE_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_idle_timeouts_total", METRIC_PREFIX),
        "Total connections closed for inactivity"
    ).unwrap();
}

/// Encode the default registry in Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        // lazy_static registers on first access
        CONNECTIONS_ACTIVE.set(1);

        let result = encode_metrics();
        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.contains("flux_connections_active"));
    }

    #[test]
    fn test_labelled_metrics() {
        MESSAGES_SENT_TOTAL.with_label_values(&["lobby"]).inc();
        BROADCAST_LATENCY.with_label_values(&["lobby"]).observe(0.002);
        ERRORS_TOTAL.with_label_values(&["backpressure"]).inc();
        // Just verify no panics
    }
}
