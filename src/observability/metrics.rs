//! Metrics collection and exposition.
//!
//! Counters, gauges, and histograms are recorded through the `metrics`
//! facade; the Prometheus recorder is installed once in `main` and its
//! handle is rendered by the engine at `/metrics` on the proxy listener.
//! The `route` label is bounded by the configured routes plus the literal
//! `unmatched`; the fallback label pair is bounded by fragment values.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Install the global Prometheus recorder. Call once at startup; the
/// returned handle renders the exposition text.
pub fn install_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record one finished request: terminal status, elapsed time, and byte
/// volumes in both directions.
pub fn record_request(
    route: &str,
    method: &str,
    status: u16,
    elapsed: Duration,
    request_bytes: u64,
    response_bytes: u64,
) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];
    counter!("rmirror_requests_total", &labels).increment(1);
    if request_bytes > 0 {
        counter!("rmirror_request_bytes_total", "route" => route.to_string())
            .increment(request_bytes);
    }
    if response_bytes > 0 {
        counter!("rmirror_response_bytes_total", "route" => route.to_string())
            .increment(response_bytes);
    }
    histogram!(
        "rmirror_request_duration_seconds",
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record an upstream error for a route.
pub fn record_upstream_error(route: &str) {
    counter!("rmirror_upstream_errors_total", "route" => route.to_string()).increment(1);
}

/// Record one TLS fragment fallback transition.
pub fn record_fallback(from: u8, to: u8) {
    counter!(
        "rmirror_tls_fallback_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// In-flight request gauge.
pub fn inflight_inc() {
    gauge!("rmirror_inflight_requests").increment(1.0);
}

pub fn inflight_dec() {
    gauge!("rmirror_inflight_requests").decrement(1.0);
}
