// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub rate_limited_total: IntCounterVec,
    pub upstream_errors_total: IntCounterVec,

    // Backend gauges
    pub backend_connections_active: IntGaugeVec,
    pub backend_mean_response_time_ms: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total proxied requests"),
            &["backend", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_request_duration_seconds",
                "Upstream request duration in seconds",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new(
                "lb_rate_limited_total",
                "Requests rejected by a backend rate limiter",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let upstream_errors_total = IntCounterVec::new(
            Opts::new(
                "lb_upstream_errors_total",
                "Requests that failed before a backend responded",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(upstream_errors_total.clone()))?;

        let backend_connections_active = IntGaugeVec::new(
            Opts::new(
                "lb_backend_connections_active",
                "Active backend connections",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_connections_active.clone()))?;

        let backend_mean_response_time_ms = IntGaugeVec::new(
            Opts::new(
                "lb_backend_mean_response_time_ms",
                "Mean backend response time in milliseconds",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_mean_response_time_ms.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            rate_limited_total,
            upstream_errors_total,
            backend_connections_active,
            backend_mean_response_time_ms,
        })
    }

    pub fn record_request(&self, backend: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[backend, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_rate_limited(&self, backend: &str) {
        self.rate_limited_total.with_label_values(&[backend]).inc();
    }

    pub fn record_upstream_error(&self, backend: &str) {
        self.upstream_errors_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn update_backend_connections(&self, backend: &str, count: usize) {
        self.backend_connections_active
            .with_label_values(&[backend])
            .set(count as i64);
    }

    pub fn update_backend_mean_response_time(&self, backend: &str, mean_ms: u64) {
        self.backend_mean_response_time_ms
            .with_label_values(&[backend])
            .set(mean_ms as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_recorded_series() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();

        metrics.record_request("a", 200, Duration::from_millis(15));
        metrics.record_rate_limited("a");
        metrics.record_upstream_error("b");
        metrics.update_backend_connections("a", 3);
        metrics.update_backend_mean_response_time("a", 42);

        let text = String::from_utf8(registry.gather().unwrap()).unwrap();
        assert!(text.contains(r#"lb_requests_total{backend="a",status_code="200"} 1"#));
        assert!(text.contains(r#"lb_rate_limited_total{backend="a"} 1"#));
        assert!(text.contains(r#"lb_upstream_errors_total{backend="b"} 1"#));
        assert!(text.contains(r#"lb_backend_connections_active{backend="a"} 3"#));
        assert!(text.contains(r#"lb_backend_mean_response_time_ms{backend="a"} 42"#));
    }
}
