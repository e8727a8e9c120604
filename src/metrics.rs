use anyhow::Context;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder};

#[derive(Clone)]
pub struct MetricsState {
    registry: Registry,
    pub request_total: IntCounterVec,
    pub classification_miss_total: IntCounterVec,
    pub plugin_error_total: IntCounterVec,
    pub capture_write_total: IntCounterVec,
    pub total_latency_ms: HistogramVec,
}

impl MetricsState {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let request_total = IntCounterVec::new(
            prometheus::Opts::new("proxy_requests_total", "Proxied requests total"),
            &["provider", "method"],
        )
        .context("create request_total")?;
        let classification_miss_total = IntCounterVec::new(
            prometheus::Opts::new(
                "proxy_classification_miss_total",
                "Requests that classified as provider=unknown",
            ),
            &["method"],
        )
        .context("create classification_miss_total")?;
        let plugin_error_total = IntCounterVec::new(
            prometheus::Opts::new("proxy_plugin_error_total", "Plugin hook errors total"),
            &["plugin", "hook"],
        )
        .context("create plugin_error_total")?;
        let capture_write_total = IntCounterVec::new(
            prometheus::Opts::new("proxy_capture_write_total", "Capture file writes total"),
            &["outcome"],
        )
        .context("create capture_write_total")?;
        let total_latency_ms = HistogramVec::new(
            HistogramOpts::new("proxy_total_latency_ms", "End-to-end request latency in ms"),
            &["provider", "streaming"],
        )
        .context("create total_latency_ms")?;

        registry
            .register(Box::new(request_total.clone()))
            .context("register request_total")?;
        registry
            .register(Box::new(classification_miss_total.clone()))
            .context("register classification_miss_total")?;
        registry
            .register(Box::new(plugin_error_total.clone()))
            .context("register plugin_error_total")?;
        registry
            .register(Box::new(capture_write_total.clone()))
            .context("register capture_write_total")?;
        registry
            .register(Box::new(total_latency_ms.clone()))
            .context("register total_latency_ms")?;

        Ok(Self {
            registry,
            request_total,
            classification_miss_total,
            plugin_error_total,
            capture_write_total,
            total_latency_ms,
        })
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encode metrics")?;
        String::from_utf8(buffer).context("metrics utf8")
    }
}
