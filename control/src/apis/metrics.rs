//! Controller metrics
//!
//! Conversion counters and timings, exported in Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Resources skipped or partially rejected during conversion
    static ref INVALID_INGRESS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "portti_invalid_ingress_total",
            "Total number of ingress resources or rules rejected during conversion",
        );
        let counter = IntCounterVec::new(opts, &["cluster", "event"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Ingress resources seen by the last pass
    static ref INGRESS_RESOURCES: IntGaugeVec = {
        let opts = Opts::new(
            "portti_ingress_resources",
            "Number of ingress resources considered by the last conversion pass",
        );
        let gauge = IntGaugeVec::new(opts, &["cluster"])
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Conversion pass duration
    static ref CONVERSION_PASS_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "portti_conversion_pass_duration_seconds",
            "Conversion pass duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["kind"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Secret changes and whether they caused a full push
    static ref SECRET_CHANGES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "portti_secret_changes_total",
            "Total number of secret changes handled by the dependency tracker",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Count a rejected resource or rule
pub fn record_invalid_ingress(cluster: &str, event: &str) {
    INVALID_INGRESS_TOTAL
        .with_label_values(&[cluster, event])
        .inc();
}

/// Record how many resources a cluster contributed to the last pass
pub fn record_ingress_resources(cluster: &str, count: usize) {
    INGRESS_RESOURCES
        .with_label_values(&[cluster])
        .set(count as i64);
}

/// Record a completed conversion pass
pub fn record_conversion_pass(kind: &str, duration_secs: f64) {
    CONVERSION_PASS_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
}

/// Record a secret change; `result` is "pushed" or "ignored"
pub fn record_secret_change(result: &str) {
    SECRET_CHANGES_TOTAL.with_label_values(&[result]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_ingress_counter_exported() {
        record_invalid_ingress("test-cluster", "EmptyRule");

        let metrics = gather_controller_metrics().expect("Should gather metrics");
        assert!(
            metrics.contains("portti_invalid_ingress_total"),
            "Should contain invalid ingress counter"
        );
        assert!(
            metrics.contains("test-cluster"),
            "Counter should be labelled with the cluster"
        );
    }

    #[test]
    fn test_conversion_pass_histogram_exported() {
        record_conversion_pass("Gateway", 0.004);
        record_ingress_resources("test-cluster", 3);
        record_secret_change("ignored");

        let metrics = gather_controller_metrics().expect("Should gather metrics");
        assert!(metrics.contains("portti_conversion_pass_duration_seconds"));
        assert!(metrics.contains("portti_ingress_resources"));
        assert!(metrics.contains("portti_secret_changes_total"));
    }
}
