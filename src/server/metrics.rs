//! Prometheus metrics for the request adapter.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Request counters and upstream latency, registered in a private registry.
#[derive(Clone)]
pub struct AdapterMetrics {
    registry: Registry,
    requests: IntCounterVec,
    first_byte: HistogramVec,
}

impl AdapterMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("adapter_requests_total", "Requests handled, by route and outcome"),
            &["route", "outcome"],
        )?;
        let first_byte = HistogramVec::new(
            HistogramOpts::new(
                "adapter_upstream_first_byte_seconds",
                "Time until the engine returned response headers",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["route"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(first_byte.clone()))?;

        Ok(Self {
            registry,
            requests,
            first_byte,
        })
    }

    pub fn record_request(&self, route: &str, outcome: &str) {
        self.requests.with_label_values(&[route, outcome]).inc();
    }

    pub fn observe_first_byte(&self, route: &str, elapsed: Duration) {
        self.first_byte
            .with_label_values(&[route])
            .observe(elapsed.as_secs_f64());
    }

    /// Current values in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
