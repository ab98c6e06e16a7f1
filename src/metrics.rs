use log::warn;
use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Request counters and latency histograms, one registry per engine.
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Proxied requests by route and response status").namespace("gateway"),
            &["route", "status"],
        )
        .expect("valid requests_total metric definition");
        let latency = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Upstream request latency by route").namespace("gateway"),
            &["route"],
        )
        .expect("valid request_duration_seconds metric definition");

        let registry = Registry::new();
        if let Err(err) = registry.register(Box::new(requests.clone())) {
            warn!("Failed to register requests_total metric: {}", err);
        }
        if let Err(err) = registry.register(Box::new(latency.clone())) {
            warn!("Failed to register request_duration_seconds metric: {}", err);
        }

        Self {
            registry,
            requests,
            latency,
        }
    }

    pub fn observe(&self, route: &str, status: u16, latency: Duration) {
        self.requests
            .with_label_values(&[route, status.to_string().as_str()])
            .inc();
        self.latency.with_label_values(&[route]).observe(latency.as_secs_f64());
    }

    /// Current `requests_total` value for one series. Reading never creates
    /// the series, so unobserved labels stay out of the exposition.
    pub fn request_count(&self, route: &str, status: u16) -> u64 {
        let status = status.to_string();
        self.requests
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                metric.get_label().iter().all(|label| match label.get_name() {
                    "route" => label.get_value() == route,
                    "status" => label.get_value() == status,
                    _ => true,
                })
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .unwrap_or(0)
    }

    /// Prometheus text exposition of everything observed so far.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!("Failed to encode metrics: {}", err);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
