use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::orchestrator::{RunStatus, StopReason, ValidationFailure};
use crate::stats::StatisticsSnapshot;

/// Latency samples needed before live alerts are raised.
pub const ALERT_MIN_SAMPLES: u64 = 10;

/// Pass/fail limits checked against the final snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SlaThresholds {
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate_percent: f64,
}

impl Default for SlaThresholds {
    fn default() -> Self {
        Self {
            p95_latency_ms: 200.0,
            p99_latency_ms: 500.0,
            success_rate_percent: 99.5,
        }
    }
}

impl SlaThresholds {
    /// Latency limits pass trivially when no latency was measured.
    pub fn evaluate(&self, snapshot: &StatisticsSnapshot) -> SlaReport {
        let measured = snapshot.latency.count > 0;
        let p95_ok = !measured || snapshot.latency.p95_ms <= self.p95_latency_ms;
        let p99_ok = !measured || snapshot.latency.p99_ms <= self.p99_latency_ms;
        let success_rate_ok = snapshot.success_rate() >= self.success_rate_percent;

        SlaReport {
            thresholds: self.clone(),
            p95_ok,
            p99_ok,
            success_rate_ok,
            passed: p95_ok && p99_ok && success_rate_ok,
        }
    }

    /// Latency breaches worth flagging while a run is still going. Quiet
    /// until `ALERT_MIN_SAMPLES` latencies were measured.
    pub fn alerts(&self, snapshot: &StatisticsSnapshot) -> Vec<String> {
        let latency = &snapshot.latency;
        let mut alerts = Vec::new();

        if latency.count < ALERT_MIN_SAMPLES {
            return alerts;
        }

        if latency.p95_ms > self.p95_latency_ms {
            alerts.push(format!(
                "p95 latency {:.1}ms exceeds {:.1}ms",
                latency.p95_ms, self.p95_latency_ms
            ));
        }
        if latency.p99_ms > self.p99_latency_ms {
            alerts.push(format!(
                "p99 latency {:.1}ms exceeds {:.1}ms",
                latency.p99_ms, self.p99_latency_ms
            ));
        }

        alerts
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SlaReport {
    pub thresholds: SlaThresholds,
    pub p95_ok: bool,
    pub p99_ok: bool,
    pub success_rate_ok: bool,
    pub passed: bool,
}

/// The one final report of a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub tenants: usize,
    pub devices_provisioned: usize,
    pub devices_validated: usize,
    pub validation_failures: Vec<ValidationFailure>,
    pub snapshot: StatisticsSnapshot,
    pub sla: SlaReport,
}

/// A periodic view of a running test.
#[derive(Serialize, Clone, Debug)]
pub struct Progress {
    pub snapshot: StatisticsSnapshot,
    /// Successful sends per second since the previous tick.
    pub sent_rate: f64,
    pub failed_rate: f64,
    pub workers: i64,
}

/// Destination for progress ticks and the final report.
pub trait ReportSink: Send + Sync {
    fn progress(&self, _progress: &Progress) {}

    fn final_report(&self, report: &RunReport);
}

impl ReportSink for Vec<Box<dyn ReportSink>> {
    fn progress(&self, progress: &Progress) {
        for sink in self {
            sink.progress(progress);
        }
    }

    fn final_report(&self, report: &RunReport) {
        for sink in self {
            sink.final_report(report);
        }
    }
}

/// Writes human readable lines through `log`.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn progress(&self, progress: &Progress) {
        let snapshot = &progress.snapshot;
        info!(
            "[{:>6.0}s] sent: {} failed: {} rate: {:.1} msg/s p95: {:.1}ms workers: {}",
            snapshot.elapsed.as_secs_f64(),
            snapshot.sent,
            snapshot.failed,
            progress.sent_rate,
            snapshot.latency.p95_ms,
            progress.workers
        );
    }

    fn final_report(&self, report: &RunReport) {
        let snapshot = &report.snapshot;

        info!("Load test {:?} ({:?})", report.status, report.stop_reason);
        info!(
            "Tenants: {}, devices provisioned: {}, validated: {}",
            report.tenants, report.devices_provisioned, report.devices_validated
        );
        for failure in &report.validation_failures {
            warn!("Device {} excluded: {}", failure.device_id, failure.reason);
        }

        info!(
            "Duration: {:.1}s, sent: {}, failed: {}, forced cancellations: {}",
            snapshot.elapsed.as_secs_f64(),
            snapshot.sent,
            snapshot.failed,
            snapshot.forced_cancellations
        );
        info!(
            "Throughput: {:.2} msg/s, success rate: {:.2}%",
            snapshot.throughput(),
            snapshot.success_rate()
        );

        for (protocol, stats) in &snapshot.protocols {
            info!(
                "  {}: devices {}, sent {}, failed {}, forced {}",
                protocol, stats.devices, stats.sent, stats.failed, stats.forced_cancellations
            );
        }
        for (kind, count) in &snapshot.errors {
            info!("  error {}: {}", kind, count);
        }

        let latency = &snapshot.latency;
        if latency.count > 0 {
            info!(
                "Latency ms: min {:.1} mean {:.1} p50 {:.1} p90 {:.1} p95 {:.1} p99 {:.1} p99.9 {:.1} max {:.1}",
                latency.min_ms,
                latency.mean_ms,
                latency.p50_ms,
                latency.p90_ms,
                latency.p95_ms,
                latency.p99_ms,
                latency.p999_ms,
                latency.max_ms
            );
        }

        let intervals = &snapshot.intervals;
        if intervals.count > 0 {
            info!(
                "Intervals: mean {:.2}s, std dev {:.2}s, cv {:.2}, {:.1}/min",
                intervals.mean_secs,
                intervals.std_dev_secs,
                intervals.coefficient_of_variation,
                intervals.rate_per_minute
            );
        }

        if report.sla.passed {
            info!("SLA passed");
        } else {
            warn!(
                "SLA failed (p95 ok: {}, p99 ok: {}, success rate ok: {})",
                report.sla.p95_ok, report.sla.p99_ok, report.sla.success_rate_ok
            );
        }
    }
}

/// Writes the final report as pretty JSON into a directory.
#[derive(Debug)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn write(&self, report: &RunReport) -> Result<PathBuf, LoadError> {
        fs::create_dir_all(&self.dir)?;

        let name = format!(
            "hono_load_report_{}.json",
            report.started_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(name);
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, report)?;

        Ok(path)
    }
}

impl ReportSink for JsonFileSink {
    fn final_report(&self, report: &RunReport) {
        match self.write(report) {
            Ok(path) => info!("Report written to {}", path.display()),
            Err(e) => error!("Failed to write report: {}", e),
        }
    }
}
