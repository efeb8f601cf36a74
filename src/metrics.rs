//! Prometheus metrics for the request pipeline

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Metrics for the request pipeline
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,

    /// Requests by terminal outcome (`success` or an error kind)
    pub requests_total: IntCounterVec,

    /// Result-cache lookups by result: hit, miss, stale
    pub result_cache_total: IntCounterVec,

    /// Loader attempts by loader name and result
    pub loader_attempts_total: IntCounterVec,

    /// Best-effort writes that failed, by stage: original, result
    pub backend_write_failures_total: IntCounterVec,

    pub request_duration_seconds: Histogram,
    pub process_duration_seconds: Histogram,

    /// Time spent waiting for a processing slot
    pub process_queue_wait_seconds: Histogram,

    /// Requests currently inside the processing stage
    pub processing_in_flight: IntGauge,
}

impl RelayMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("image_relay_requests_total", "Total number of image requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let result_cache_total = IntCounterVec::new(
            Opts::new("image_relay_result_cache_total", "Result cache lookups by result"),
            &["result"],
        )?;
        registry.register(Box::new(result_cache_total.clone()))?;

        let loader_attempts_total = IntCounterVec::new(
            Opts::new("image_relay_loader_attempts_total", "Loader attempts by loader and result"),
            &["loader", "result"],
        )?;
        registry.register(Box::new(loader_attempts_total.clone()))?;

        let backend_write_failures_total = IntCounterVec::new(
            Opts::new(
                "image_relay_backend_write_failures_total",
                "Failed best-effort storage writes by stage",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(backend_write_failures_total.clone()))?;

        let request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "image_relay_request_duration_seconds",
                "Duration of image requests in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let process_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "image_relay_process_duration_seconds",
                "Duration of the processing stage in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(process_duration_seconds.clone()))?;

        let process_queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "image_relay_process_queue_wait_seconds",
                "Time spent waiting for a processing slot in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(process_queue_wait_seconds.clone()))?;

        let processing_in_flight = IntGauge::new(
            "image_relay_processing_in_flight",
            "Requests currently in the processing stage",
        )?;
        registry.register(Box::new(processing_in_flight.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            result_cache_total,
            loader_attempts_total,
            backend_write_failures_total,
            request_duration_seconds,
            process_duration_seconds,
            process_queue_wait_seconds,
            processing_in_flight,
        })
    }

    /// Record a finished request
    pub fn record_request(&self, outcome: &str, duration: Duration) {
        self.requests_total.with_label_values(&[outcome]).inc();
        self.request_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Record a result cache lookup: `hit`, `miss` or `stale`
    pub fn record_result_cache(&self, result: &str) {
        self.result_cache_total.with_label_values(&[result]).inc();
    }

    pub fn record_loader_attempt(&self, loader: &str, result: &str) {
        self.loader_attempts_total
            .with_label_values(&[loader, result])
            .inc();
    }

    pub fn record_write_failure(&self, stage: &str) {
        self.backend_write_failures_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn record_queue_wait(&self, wait: Duration) {
        self.process_queue_wait_seconds.observe(wait.as_secs_f64());
    }

    pub fn record_process_duration(&self, duration: Duration) {
        self.process_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
