//! Prometheus metrics for the HTTP surface and pipeline outcomes.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "nemorosa_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("nemorosa_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "nemorosa_http_requests_in_flight",
        "HTTP requests currently being processed",
    )
    .unwrap()
});

/// Authentication failures by reason.
pub static AUTH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("nemorosa_auth_failures_total", "Authentication failures"),
        &["reason"],
    )
    .unwrap()
});

/// Pipeline runs by terminal result.
pub static PIPELINE_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "nemorosa_pipeline_outcomes_total",
            "Pipeline runs by terminal result",
        ),
        &["result"],
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();
    registry
        .register(Box::new(AUTH_FAILURES_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(PIPELINE_OUTCOMES_TOTAL.clone()))
        .unwrap();
}

/// Collapse high-cardinality path segments before labeling.
pub fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/jobs" | "/metrics" | "/api/webhook" => path.to_string(),
        _ => "/other".to_string(),
    }
}

/// Render the registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_paths_keep_their_label() {
        assert_eq!(normalize_path("/api/webhook"), "/api/webhook");
        assert_eq!(normalize_path("/jobs"), "/jobs");
        assert_eq!(normalize_path("/random/thing"), "/other");
    }

    #[test]
    fn registry_renders() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/", "200"])
            .inc();
        let output = gather();
        assert!(output.contains("nemorosa_http_requests_total"));
    }
}
