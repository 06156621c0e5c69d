//! Metrics collection for BrainChat
//!
//! This module provides Prometheus metrics for observability.
//! Recording is a handful of atomic operations per request, well off the
//! generation hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for BrainChat
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub workers: WorkerMetrics,
    pub models: ModelMetrics,
}

/// Per-request metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of chat requests dispatched
    pub requests_total: IntCounter,

    /// Total number of requests that produced a reply
    pub requests_success: IntCounter,

    /// Total number of requests that failed or timed out
    pub requests_failed: IntCounter,

    /// End-to-end dispatch duration
    pub request_duration: Histogram,

    /// Requests currently being dispatched
    pub active_requests: IntGauge,
}

/// Worker pool metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Fragments produced by workers
    pub fragments_total: IntCounter,

    /// Worker generate calls that failed or panicked
    pub worker_failures_total: IntCounter,

    /// Duration of a single generate call
    pub generate_duration: Histogram,

    /// Size of the most recently built worker pool
    pub pool_workers: IntGauge,
}

/// Model loading metrics
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    /// Successful model loads
    pub loads_total: IntCounter,

    /// Failed model loads
    pub load_failures_total: IntCounter,

    /// Bytes mapped for the most recently loaded model
    pub resident_bytes: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn duration_histogram(name: &str, help: &str, buckets: Vec<f64>) -> prometheus::Result<Histogram> {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        Self::try_new().expect("metric definitions are valid and uniquely named")
    }

    /// Create a new metrics registry, reporting registration errors
    pub fn try_new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Request metrics
        let requests_total = IntCounter::new(
            "chat_requests_total",
            "Total number of chat requests dispatched",
        )?;

        let requests_success = IntCounter::new(
            "chat_requests_success_total",
            "Total number of chat requests that produced a reply",
        )?;

        let requests_failed = IntCounter::new(
            "chat_requests_failed_total",
            "Total number of chat requests that failed or timed out",
        )?;

        let request_duration = duration_histogram(
            "chat_request_duration_seconds",
            "Chat request dispatch duration in seconds",
            vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )?;

        let active_requests = IntGauge::new(
            "chat_active_requests",
            "Current number of chat requests being dispatched",
        )?;

        // Worker metrics
        let fragments_total = IntCounter::new(
            "worker_fragments_total",
            "Total number of fragments produced by workers",
        )?;

        let worker_failures_total = IntCounter::new(
            "worker_failures_total",
            "Total number of failed or panicked generate calls",
        )?;

        let generate_duration = duration_histogram(
            "worker_generate_duration_seconds",
            "Duration of a single worker generate call in seconds",
            vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        )?;

        let pool_workers = IntGauge::new(
            "worker_pool_size",
            "Number of threads in the response worker pool",
        )?;

        // Model metrics
        let loads_total = IntCounter::new(
            "model_loads_total",
            "Total number of successful model loads",
        )?;

        let load_failures_total = IntCounter::new(
            "model_load_failures_total",
            "Total number of failed model loads",
        )?;

        let resident_bytes = IntGauge::new(
            "model_resident_bytes",
            "Bytes mapped for the loaded model",
        )?;

        // Register all metrics
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_success.clone()))?;
        registry.register(Box::new(requests_failed.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;

        registry.register(Box::new(fragments_total.clone()))?;
        registry.register(Box::new(worker_failures_total.clone()))?;
        registry.register(Box::new(generate_duration.clone()))?;
        registry.register(Box::new(pool_workers.clone()))?;

        registry.register(Box::new(loads_total.clone()))?;
        registry.register(Box::new(load_failures_total.clone()))?;
        registry.register(Box::new(resident_bytes.clone()))?;

        Ok(MetricsRegistry {
            registry,
            requests: RequestMetrics {
                requests_total,
                requests_success,
                requests_failed,
                request_duration,
                active_requests,
            },
            workers: WorkerMetrics {
                fragments_total,
                worker_failures_total,
                generate_duration,
                pool_workers,
            },
            models: ModelMetrics {
                loads_total,
                load_failures_total,
                resident_bytes,
            },
        })
    }

    /// Gather all metrics in the Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
