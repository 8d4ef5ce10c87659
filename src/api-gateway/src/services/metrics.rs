//! Prometheus metrics for the gateway

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::error::{GatewayError, Result};

/// Gateway-wide counters and histograms
#[derive(Clone)]
pub struct MetricsService {
    registry: Arc<Registry>,
    pub requests_total: CounterVec,
    pub request_duration_seconds: HistogramVec,
    pub requests_in_flight: Gauge,
    pub rate_limit_rejections_total: CounterVec,
    pub circuit_open_total: CounterVec,
    pub events_published_total: CounterVec,
}

impl MetricsService {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Proxied requests by outcome"),
            &["method", "service", "status"],
        )
        .map_err(|e| GatewayError::internal(e.to_string()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "End-to-end request duration",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method", "service"],
        )
        .map_err(|e| GatewayError::internal(e.to_string()))?;

        let requests_in_flight = Gauge::new(
            "gateway_requests_in_flight",
            "Requests currently in the pipeline",
        )
        .map_err(|e| GatewayError::internal(e.to_string()))?;

        let rate_limit_rejections_total = CounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Requests rejected by the rate limiter",
            ),
            &["policy"],
        )
        .map_err(|e| GatewayError::internal(e.to_string()))?;

        let circuit_open_total = CounterVec::new(
            Opts::new(
                "gateway_circuit_open_total",
                "Requests short-circuited by an open breaker",
            ),
            &["service"],
        )
        .map_err(|e| GatewayError::internal(e.to_string()))?;

        let events_published_total = CounterVec::new(
            Opts::new(
                "gateway_events_published_total",
                "Outcome events published to the bus",
            ),
            &["event_type", "outcome"],
        )
        .map_err(|e| GatewayError::internal(e.to_string()))?;

        registry
            .register(Box::new(requests_total.clone()))
            .and_then(|_| registry.register(Box::new(request_duration_seconds.clone())))
            .and_then(|_| registry.register(Box::new(requests_in_flight.clone())))
            .and_then(|_| registry.register(Box::new(rate_limit_rejections_total.clone())))
            .and_then(|_| registry.register(Box::new(circuit_open_total.clone())))
            .and_then(|_| registry.register(Box::new(events_published_total.clone())))
            .map_err(|e| GatewayError::internal(e.to_string()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            requests_in_flight,
            rate_limit_rejections_total,
            circuit_open_total,
            events_published_total,
        })
    }

    /// Text exposition for `GET /metrics`
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| GatewayError::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        let metrics = MetricsService::new().unwrap();
        metrics
            .requests_total
            .with_label_values(&["GET", "erp", "200"])
            .inc();
        metrics
            .rate_limit_rejections_total
            .with_label_values(&["default"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("gateway_rate_limit_rejections_total"));
    }
}
