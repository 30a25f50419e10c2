use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request counters
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_requests_total", "Total number of dispatched requests"),
        &["route", "status"],
    )
    .unwrap()
});

// Upstream metrics
pub static UPSTREAM_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "gateway_upstream_latency_seconds",
            "Time until upstream response headers",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["service"],
    )
    .unwrap()
});

// Breaker metrics
pub static BREAKER_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "gateway_breaker_state",
            "Circuit state per dependency (0 closed, 1 open, 2 half-open)",
        ),
        &["dependency"],
    )
    .unwrap()
});

pub static BREAKER_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gateway_breaker_rejections_total",
            "Calls rejected without a network attempt",
        ),
        &["dependency"],
    )
    .unwrap()
});

pub static IDENTITY_CALLS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_identity_calls_total", "Token introspection results"),
        &["result"],
    )
    .unwrap()
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(REQUESTS_TOTAL.clone()),
            Box::new(UPSTREAM_LATENCY.clone()),
            Box::new(BREAKER_STATE.clone()),
            Box::new(BREAKER_REJECTIONS.clone()),
            Box::new(IDENTITY_CALLS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::error!("Failed to register metric: {}", e);
            }
        }
    });
}

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_metrics_are_exported() {
        register_metrics();
        register_metrics();
        REQUESTS_TOTAL.with_label_values(&["metrics-test", "200"]).inc();
        BREAKER_STATE.with_label_values(&["metrics-test"]).set(1);

        let output = metrics_output();
        assert!(output.contains("gateway_requests_total{route=\"metrics-test\",status=\"200\"}"));
        assert!(output.contains("gateway_breaker_state{dependency=\"metrics-test\"} 1"));
    }
}
