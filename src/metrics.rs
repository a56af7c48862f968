//! Prometheus metrics for admission decisions.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Encoder, Gauge, Histogram,
    TextEncoder,
};

use crate::error::{GatekeeperError, Result};

lazy_static! {
    pub static ref ADMITTED_TOTAL: Counter =
        register_counter!("gatekeeper_admitted_total", "Requests admitted by the rate limiter")
            .expect("metric can be registered");
    pub static ref DENIED_TOTAL: Counter =
        register_counter!("gatekeeper_denied_total", "Requests rejected with 429")
            .expect("metric can be registered");
    pub static ref FAIL_OPEN_TOTAL: Counter = register_counter!(
        "gatekeeper_fail_open_total",
        "Requests admitted without a decision because of an internal error or timeout"
    )
    .expect("metric can be registered");
    pub static ref REAPED_TOTAL: Counter =
        register_counter!("gatekeeper_reaped_total", "Expired counters evicted by the reaper")
            .expect("metric can be registered");
    pub static ref DECISION_SECONDS: Histogram = register_histogram!(
        "gatekeeper_decision_seconds",
        "Latency of one admission decision in seconds"
    )
    .expect("metric can be registered");
    pub static ref ACTIVE_COUNTERS: Gauge =
        register_gauge!("gatekeeper_active_counters", "Counters held by the store")
            .expect("metric can be registered");
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| GatekeeperError::Metrics(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| GatekeeperError::Metrics(format!("Metrics are not UTF-8: {}", e)))
}
