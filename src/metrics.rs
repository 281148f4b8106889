use std::fmt;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::LoadError;
use crate::message::MessageOutcome;

const LATENCY_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.5, 1.0, 2.5, 5.0];

/// Prometheus view of one run. Owned by the run, not process-global, so
/// several runs can coexist.
pub struct RunMetrics {
    registry: Registry,
    messages: IntCounterVec,
    latency: HistogramVec,
    forced_cancellations: IntCounter,
    active_workers: IntGauge,
}

impl RunMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let messages = IntCounterVec::new(
            Opts::new("hono_load_messages_total", "Send attempts by protocol and result"),
            &["protocol", "result"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("hono_load_latency_seconds", "Latency of successful sends")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["protocol"],
        )?;
        let forced_cancellations = IntCounter::new(
            "hono_load_forced_cancellations_total",
            "Workers aborted after the shutdown grace period",
        )?;
        let active_workers = IntGauge::new("hono_load_active_workers", "Running device workers")?;

        let registry = Registry::new();
        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(forced_cancellations.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;

        Ok(Self {
            registry,
            messages,
            latency,
            forced_cancellations,
            active_workers,
        })
    }

    pub fn observe(&self, outcome: &MessageOutcome) {
        let protocol = outcome.protocol.as_str();
        let result = if outcome.success { "success" } else { "failure" };

        self.messages.with_label_values(&[protocol, result]).inc();

        if let Some(latency) = outcome.latency {
            self.latency
                .with_label_values(&[protocol])
                .observe(latency.as_secs_f64());
        }
    }

    pub fn increment_forced_cancellations(&self) {
        self.forced_cancellations.inc();
    }

    pub fn increment_active_workers(&self) {
        self.active_workers.inc();
    }

    pub fn decrement_active_workers(&self) {
        self.active_workers.dec();
    }

    pub fn active_workers(&self) -> i64 {
        self.active_workers.get()
    }

    pub fn get_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format, as served on `/metrics`.
    pub fn encode(&self) -> Result<String, LoadError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.get_metrics(), &mut buffer)
            .map_err(|e| LoadError::Server(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| LoadError::Server(e.to_string()))
    }
}

impl fmt::Debug for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunMetrics")
            .field("active_workers", &self.active_workers.get())
            .field("forced_cancellations", &self.forced_cancellations.get())
            .finish()
    }
}
