use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::Protocol;
use crate::error::ErrorKind;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub devices: usize,
    pub sent: u64,
    pub failed: u64,
    pub forced_cancellations: u64,
}

impl ProtocolStats {
    pub fn total(&self) -> u64 {
        self.sent + self.failed
    }
}

/// Latency figures in milliseconds. All zero when nothing was measured.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub retained: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p999_ms: f64,
}

/// Samples slower than each threshold. A sample lands only in the highest
/// band it exceeds.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LatencyBands {
    pub over_50ms: u64,
    pub over_100ms: u64,
    pub over_200ms: u64,
    pub over_500ms: u64,
    pub over_1000ms: u64,
}

impl LatencyBands {
    pub fn observe(&mut self, latency: Duration) {
        let ms = latency.as_millis();

        if ms > 1000 {
            self.over_1000ms += 1;
        } else if ms > 500 {
            self.over_500ms += 1;
        } else if ms > 200 {
            self.over_200ms += 1;
        } else if ms > 100 {
            self.over_100ms += 1;
        } else if ms > 50 {
            self.over_50ms += 1;
        }
    }
}

/// Distribution of the waits workers drew between sends.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IntervalStats {
    pub count: u64,
    pub mean_secs: f64,
    pub std_dev_secs: f64,
    pub coefficient_of_variation: f64,
    pub rate_per_minute: f64,
}

/// Welford running mean/variance.
#[derive(Debug, Default, Clone)]
pub(crate) struct IntervalAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl IntervalAccumulator {
    pub fn push(&mut self, wait: Duration) {
        let x = wait.as_secs_f64();
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn stats(&self) -> IntervalStats {
        if self.count == 0 {
            return IntervalStats::default();
        }

        let std_dev = (self.m2 / self.count as f64).sqrt();
        let (cv, rate) = if self.mean > 0.0 {
            (std_dev / self.mean, 60.0 / self.mean)
        } else {
            (0.0, 0.0)
        };

        IntervalStats {
            count: self.count,
            mean_secs: self.mean,
            std_dev_secs: std_dev,
            coefficient_of_variation: cv,
            rate_per_minute: rate,
        }
    }
}

/// Consistent, read-only copy of the aggregate state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatisticsSnapshot {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub sent: u64,
    pub failed: u64,
    pub forced_cancellations: u64,
    pub protocols: BTreeMap<Protocol, ProtocolStats>,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub latency: LatencySummary,
    pub latency_bands: LatencyBands,
    pub intervals: IntervalStats,
    pub finalized: bool,
}

impl StatisticsSnapshot {
    pub fn total(&self) -> u64 {
        self.sent + self.failed
    }

    /// Successful messages per second of run time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sent as f64 / secs
        } else {
            0.0
        }
    }

    /// Percentage of attempts that succeeded, 100 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 100.0,
            total => self.sent as f64 / total as f64 * 100.0,
        }
    }
}
