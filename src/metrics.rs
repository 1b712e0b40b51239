//! Prometheus metrics for the middleware pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener when `METRICS_PORT` is
//! non-zero. Without an installed exporter every recording function is a
//! no-op, so middleware records unconditionally.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gatehouse_http_requests_total` - Completed requests (labels: method, status)
//! - `gatehouse_http_response_bytes_total` - Response body bytes written
//! - `gatehouse_rate_limited_total` - Requests denied by the rate limiter
//! - `gatehouse_admin_rejected_total` - Requests denied by the admin guard
//!
//! ## Histograms
//! - `gatehouse_http_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `gatehouse_rate_limiter_keys` - Client keys currently tracked by the limiter

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "gatehouse_http_requests_total";
    pub const HTTP_RESPONSE_BYTES_TOTAL: &str = "gatehouse_http_response_bytes_total";
    pub const RATE_LIMITED_TOTAL: &str = "gatehouse_rate_limited_total";
    pub const ADMIN_REJECTED_TOTAL: &str = "gatehouse_admin_rejected_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "gatehouse_http_request_duration_seconds";
    pub const RATE_LIMITER_KEYS: &str = "gatehouse_rate_limiter_keys";
}

/// Initialize the Prometheus metrics exporter on `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::HTTP_REQUESTS_TOTAL,
        "Total number of completed HTTP requests"
    );
    describe_counter!(
        names::HTTP_RESPONSE_BYTES_TOTAL,
        "Total response body bytes written"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests denied by the per-client rate limiter"
    );
    describe_counter!(
        names::ADMIN_REJECTED_TOTAL,
        "Total number of requests denied by the admin guard"
    );
    describe_histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_gauge!(
        names::RATE_LIMITER_KEYS,
        "Number of client keys tracked by the rate limiter"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record one completed request.
pub fn record_request(method: &str, status: u16, bytes: u64, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::HTTP_REQUESTS_TOTAL, "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status)
        .record(duration_secs);
    counter!(names::HTTP_RESPONSE_BYTES_TOTAL).increment(bytes);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_admin_rejected() {
    counter!(names::ADMIN_REJECTED_TOTAL).increment(1);
}

pub fn set_rate_limiter_keys(count: usize) {
    gauge!(names::RATE_LIMITER_KEYS).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an exporter these must be silent no-ops.

    #[test]
    fn test_record_request() {
        record_request("GET", 200, 512, 0.01);
    }

    #[test]
    fn test_record_denials() {
        record_rate_limited();
        record_admin_rejected();
    }

    #[test]
    fn test_set_rate_limiter_keys() {
        set_rate_limiter_keys(0);
        set_rate_limiter_keys(42);
    }
}
