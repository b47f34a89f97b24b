//! Prometheus metrics for Parley Gateway
//!
//! Exposes call counts, latency and token usage of the proxied conversations.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // ============================================================================
    // Call Metrics
    // ============================================================================

    /// Conversation calls by route and outcome
    pub static ref CALLS_TOTAL: CounterVec =
        register_counter_vec!("parley_calls_total", "Conversation calls by route and outcome", &["route", "outcome"]).unwrap();

    /// End-to-end call latency, provider time included
    pub static ref CALL_LATENCY: HistogramVec = register_histogram_vec!(
        "parley_call_latency_seconds",
        "Conversation call latency in seconds",
        &["route"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    /// Tokens sent and received
    pub static ref TOKENS_TOTAL: CounterVec =
        register_counter_vec!("parley_tokens_total", "Tokens by model and direction", &["model", "direction"]).unwrap();

    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Sessions currently registered
    pub static ref SESSIONS: Gauge =
        register_gauge!("parley_sessions", "Number of registered sessions").unwrap();

    // ============================================================================
    // System Metrics
    // ============================================================================

    /// Build info
    pub static ref BUILD_INFO: GaugeVec =
        register_gauge_vec!("parley_build_info", "Build information", &["version", "commit"]).unwrap();
}

/// Initialize metrics with build info
pub fn init_metrics() {
    BUILD_INFO
        .with_label_values(&[
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_COMMIT_SHA").unwrap_or("unknown"),
        ])
        .set(1.0);
}

/// Record one finished call.
pub fn observe_call(route: &str, outcome: &str, seconds: f64) {
    CALLS_TOTAL.with_label_values(&[route, outcome]).inc();
    CALL_LATENCY.with_label_values(&[route]).observe(seconds);
}

#[allow(clippy::cast_precision_loss)]
pub fn observe_tokens(model: &str, token_in: usize, token_out: usize) {
    TOKENS_TOTAL
        .with_label_values(&[model, "input"])
        .inc_by(token_in as f64);
    TOKENS_TOTAL
        .with_label_values(&[model, "output"])
        .inc_by(token_out as f64);
}

/// Export metrics in Prometheus format
pub fn export() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_can_be_exported() {
        observe_call("api", "ok", 0.2);
        observe_tokens("gpt-4", 12, 3);
        SESSIONS.set(4.0);

        let exported = export();
        assert!(exported.contains("parley_calls_total"));
        assert!(exported.contains("parley_tokens_total"));
        assert!(exported.contains("parley_sessions"));
    }
}
