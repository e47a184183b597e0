//! Metrics collection for chat backends

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry, CounterVec,
    HistogramVec, Opts, Registry,
};
use std::time::Duration;

/// Chat request metrics with a registry owned by this instance
pub struct ChatMetrics {
    registry: Registry,
    pub chat_requests: CounterVec,
    pub chat_request_duration: HistogramVec,
}

impl ChatMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let chat_requests = register_counter_vec_with_registry!(
            Opts::new("doculens_chat_requests_total", "Total vision chat requests"),
            &["backend", "status"],
            registry
        )?;

        let chat_request_duration = register_histogram_vec_with_registry!(
            "doculens_chat_request_duration_seconds",
            "Vision chat request duration in seconds",
            &["backend"],
            registry
        )?;

        Ok(Self {
            registry,
            chat_requests,
            chat_request_duration,
        })
    }

    /// Record one finished chat call
    pub fn record_chat(&self, backend: &str, status: &str, elapsed: Duration) {
        self.chat_requests.with_label_values(&[backend, status]).inc();
        self.chat_request_duration
            .with_label_values(&[backend])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of chat calls seen for a backend/status pair
    pub fn chat_count(&self, backend: &str, status: &str) -> u64 {
        self.chat_requests.with_label_values(&[backend, status]).get() as u64
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        assert!(ChatMetrics::new().is_ok());
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let first = ChatMetrics::new().unwrap();
        let second = ChatMetrics::new().unwrap();

        first.record_chat("openai", "success", Duration::from_millis(120));
        first.record_chat("openai", "error", Duration::from_millis(30));

        assert_eq!(first.chat_count("openai", "success"), 1);
        assert_eq!(second.chat_count("openai", "success"), 0);
    }

    #[test]
    fn test_export_prometheus_text() {
        let metrics = ChatMetrics::new().unwrap();
        metrics.record_chat("anthropic", "success", Duration::from_millis(10));

        let text = metrics.export();
        assert!(text.contains("doculens_chat_requests_total"));
        assert!(text.contains("backend=\"anthropic\""));
    }
}
