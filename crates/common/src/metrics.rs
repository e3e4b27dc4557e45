//! Metrics collection for ChatServe
//!
//! This module provides Prometheus metrics for observability.
//! All metrics are carefully designed to minimize overhead in the hot path.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ChatServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub generation: GenerationMetrics,
    pub worker: WorkerMetrics,
    pub controller: ControllerMetrics,
}

/// Generation-related metrics
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    /// Total number of generation requests admitted
    pub requests_total: IntCounter,

    /// Requests that ended without an error frame
    pub requests_success: IntCounter,

    /// Requests rejected before a slot was taken
    pub requests_rejected: IntCounter,

    /// Requests that ended with an error frame
    pub requests_failed: IntCounter,

    /// Error frames caused by engine resource exhaustion
    pub resource_exhausted: IntCounter,

    /// Requests whose client disconnected mid-stream
    pub requests_cancelled: IntCounter,

    /// Request duration histogram (slot held)
    pub request_duration: Histogram,

    /// Time spent waiting for a slot
    pub queue_time: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Frames streamed to clients
    pub frames_emitted_total: IntCounter,
}

/// Worker-specific metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Slots currently held by running sessions
    pub slots_in_use: IntGauge,

    /// Requests waiting for a slot
    pub slots_waiting: IntGauge,

    /// Live cached engine states
    pub live_engine_caches: IntGauge,

    /// Heartbeats acknowledged by the controller
    pub heartbeats_sent: IntCounter,

    /// Heartbeat or registration calls that failed
    pub heartbeat_failures: IntCounter,

    /// Successful registrations
    pub registrations: IntCounter,
}

/// Controller-specific metrics
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    /// Workers currently registered
    pub registered_workers: IntGauge,

    /// Workers dropped for missing heartbeats
    pub expired_workers: IntCounter,

    /// Heartbeats received
    pub heartbeats_received: IntCounter,

    /// Worker addresses handed out
    pub dispatches: IntCounter,

    /// Dispatch requests with no worker for the model
    pub no_workers_available: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets)).unwrap()
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Generation metrics
        let requests_total = IntCounter::new(
            "generation_requests_total",
            "Total number of generation requests admitted"
        ).unwrap();

        let requests_success = IntCounter::new(
            "generation_requests_success_total",
            "Generation requests that completed without error"
        ).unwrap();

        let requests_rejected = IntCounter::new(
            "generation_requests_rejected_total",
            "Generation requests rejected by validation"
        ).unwrap();

        let requests_failed = IntCounter::new(
            "generation_requests_failed_total",
            "Generation requests that ended with an error frame"
        ).unwrap();

        let resource_exhausted = IntCounter::new(
            "generation_resource_exhausted_total",
            "Error frames caused by engine resource exhaustion"
        ).unwrap();

        let requests_cancelled = IntCounter::new(
            "generation_requests_cancelled_total",
            "Generation requests abandoned by the client"
        ).unwrap();

        let request_duration = histogram(
            "generation_request_duration_seconds",
            "Time a generation holds its slot, in seconds",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        );

        let queue_time = histogram(
            "generation_queue_time_seconds",
            "Time requests wait for a concurrency slot",
            vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0],
        );

        let tokens_generated_total = IntCounter::new(
            "generation_tokens_generated_total",
            "Total number of tokens generated"
        ).unwrap();

        let frames_emitted_total = IntCounter::new(
            "generation_frames_emitted_total",
            "Total number of frames streamed to clients"
        ).unwrap();

        // Worker metrics
        let slots_in_use = IntGauge::new(
            "worker_slots_in_use",
            "Concurrency slots currently held"
        ).unwrap();

        let slots_waiting = IntGauge::new(
            "worker_slots_waiting",
            "Requests waiting for a concurrency slot"
        ).unwrap();

        let live_engine_caches = IntGauge::new(
            "worker_live_engine_caches",
            "Cached engine states not yet released"
        ).unwrap();

        let heartbeats_sent = IntCounter::new(
            "worker_heartbeats_sent_total",
            "Heartbeats acknowledged by the controller"
        ).unwrap();

        let heartbeat_failures = IntCounter::new(
            "worker_heartbeat_failures_total",
            "Failed heartbeat or registration calls"
        ).unwrap();

        let registrations = IntCounter::new(
            "worker_registrations_total",
            "Successful registrations with the controller"
        ).unwrap();

        // Controller metrics
        let registered_workers = IntGauge::new(
            "controller_registered_workers",
            "Workers currently registered"
        ).unwrap();

        let expired_workers = IntCounter::new(
            "controller_expired_workers_total",
            "Workers removed after missing heartbeats"
        ).unwrap();

        let heartbeats_received = IntCounter::new(
            "controller_heartbeats_received_total",
            "Heartbeats received from workers"
        ).unwrap();

        let dispatches = IntCounter::new(
            "controller_dispatches_total",
            "Worker addresses handed out"
        ).unwrap();

        let no_workers_available = IntCounter::new(
            "controller_no_workers_available_total",
            "Dispatch requests with no worker serving the model"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_success.clone())).unwrap();
        registry.register(Box::new(requests_rejected.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(resource_exhausted.clone())).unwrap();
        registry.register(Box::new(requests_cancelled.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(queue_time.clone())).unwrap();
        registry.register(Box::new(tokens_generated_total.clone())).unwrap();
        registry.register(Box::new(frames_emitted_total.clone())).unwrap();

        registry.register(Box::new(slots_in_use.clone())).unwrap();
        registry.register(Box::new(slots_waiting.clone())).unwrap();
        registry.register(Box::new(live_engine_caches.clone())).unwrap();
        registry.register(Box::new(heartbeats_sent.clone())).unwrap();
        registry.register(Box::new(heartbeat_failures.clone())).unwrap();
        registry.register(Box::new(registrations.clone())).unwrap();

        registry.register(Box::new(registered_workers.clone())).unwrap();
        registry.register(Box::new(expired_workers.clone())).unwrap();
        registry.register(Box::new(heartbeats_received.clone())).unwrap();
        registry.register(Box::new(dispatches.clone())).unwrap();
        registry.register(Box::new(no_workers_available.clone())).unwrap();

        let generation = GenerationMetrics {
            requests_total,
            requests_success,
            requests_rejected,
            requests_failed,
            resource_exhausted,
            requests_cancelled,
            request_duration,
            queue_time,
            tokens_generated_total,
            frames_emitted_total,
        };

        let worker = WorkerMetrics {
            slots_in_use,
            slots_waiting,
            live_engine_caches,
            heartbeats_sent,
            heartbeat_failures,
            registrations,
        };

        let controller = ControllerMetrics {
            registered_workers,
            expired_workers,
            heartbeats_received,
            dispatches,
            no_workers_available,
        };

        MetricsRegistry {
            registry,
            generation,
            worker,
            controller,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Prometheus scrape handler shared by the worker and controller routers
pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        METRICS.gather(),
    )
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.generation.requests_total.inc();
        metrics.generation.frames_emitted_total.inc_by(3);
        metrics.worker.slots_in_use.set(2);
        metrics.controller.registered_workers.set(1);

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("generation_requests_total 1"));
        assert!(output.contains("generation_frames_emitted_total 3"));
        assert!(output.contains("worker_slots_in_use 2"));
        assert!(output.contains("controller_registered_workers 1"));
    }
}
