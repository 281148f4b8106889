use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::device::Protocol;
use crate::error::ErrorKind;
use crate::message::MessageOutcome;
use crate::metrics::RunMetrics;

mod reservoir;
mod snapshot;

pub use reservoir::{percentile, LatencyReservoir, PERCENTILES};
pub use snapshot::{IntervalStats, LatencyBands, LatencySummary, ProtocolStats, StatisticsSnapshot};

use snapshot::IntervalAccumulator;

#[derive(Debug)]
struct Tally {
    started_at: DateTime<Utc>,
    clock: Instant,
    sent: u64,
    failed: u64,
    forced_cancellations: u64,
    protocols: BTreeMap<Protocol, ProtocolStats>,
    errors: BTreeMap<ErrorKind, u64>,
    latency: LatencyReservoir,
    bands: LatencyBands,
    intervals: IntervalAccumulator,
    late_outcomes: u64,
    finalized: Option<StatisticsSnapshot>,
}

impl Tally {
    fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            started_at: self.started_at,
            elapsed: self.clock.elapsed(),
            sent: self.sent,
            failed: self.failed,
            forced_cancellations: self.forced_cancellations,
            protocols: self.protocols.clone(),
            errors: self.errors.clone(),
            latency: self.latency.summary(),
            latency_bands: self.bands.clone(),
            intervals: self.intervals.stats(),
            finalized: false,
        }
    }
}

/// The single owner of run statistics. Workers report through `record`;
/// every mutation happens inside one short critical section.
#[derive(Debug)]
pub struct Aggregator {
    tally: Mutex<Tally>,
    metrics: Option<Arc<RunMetrics>>,
}

impl Aggregator {
    pub fn new(latency_sample_cap: usize) -> Self {
        Self::with_seed(latency_sample_cap, None)
    }

    pub fn with_seed(latency_sample_cap: usize, seed: Option<u64>) -> Self {
        Self {
            tally: Mutex::new(Tally {
                started_at: Utc::now(),
                clock: Instant::now(),
                sent: 0,
                failed: 0,
                forced_cancellations: 0,
                protocols: BTreeMap::new(),
                errors: BTreeMap::new(),
                latency: LatencyReservoir::new(latency_sample_cap, seed),
                bands: LatencyBands::default(),
                intervals: IntervalAccumulator::default(),
                late_outcomes: 0,
                finalized: None,
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Restarts the run clock, so provisioning time is not counted as load time.
    pub fn mark_started(&self) {
        let mut tally = self.tally.lock();
        tally.started_at = Utc::now();
        tally.clock = Instant::now();
    }

    pub fn register_devices(&self, protocol: Protocol, count: usize) {
        let mut tally = self.tally.lock();
        tally.protocols.entry(protocol).or_default().devices += count;
    }

    pub fn record(&self, outcome: MessageOutcome) {
        {
            let mut guard = self.tally.lock();
            let tally = &mut *guard;

            if tally.finalized.is_some() {
                tally.late_outcomes += 1;
                return;
            }

            let protocol = tally.protocols.entry(outcome.protocol).or_default();
            if outcome.success {
                tally.sent += 1;
                protocol.sent += 1;
            } else {
                tally.failed += 1;
                protocol.failed += 1;
                if let Some(kind) = outcome.error_kind {
                    *tally.errors.entry(kind).or_insert(0) += 1;
                }
            }

            if let Some(latency) = outcome.latency {
                tally.latency.push(latency);
                tally.bands.observe(latency);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe(&outcome);
        }
    }

    pub fn record_interval(&self, wait: Duration) {
        let mut tally = self.tally.lock();
        if tally.finalized.is_none() {
            tally.intervals.push(wait);
        }
    }

    /// Counts a worker that had to be aborted. Kept apart from failed messages.
    pub fn record_forced_cancellation(&self, device_id: &str, protocol: Protocol) {
        {
            let mut guard = self.tally.lock();
            let tally = &mut *guard;

            if tally.finalized.is_some() {
                warn!(
                    "Ignoring forced cancellation of {} after statistics were finalized",
                    device_id
                );
                return;
            }

            tally.forced_cancellations += 1;
            tally.protocols.entry(protocol).or_default().forced_cancellations += 1;
        }

        if let Some(metrics) = &self.metrics {
            metrics.increment_forced_cancellations();
        }
    }

    /// Point-in-time copy. Once finalized, always the final snapshot.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let tally = self.tally.lock();

        match &tally.finalized {
            Some(snapshot) => snapshot.clone(),
            None => tally.snapshot(),
        }
    }

    /// Freezes the statistics. Every call returns the snapshot taken by the first.
    pub fn finalize(&self) -> StatisticsSnapshot {
        let mut tally = self.tally.lock();

        if let Some(snapshot) = &tally.finalized {
            debug!("Statistics already finalized");
            return snapshot.clone();
        }

        let mut snapshot = tally.snapshot();
        snapshot.finalized = true;
        tally.finalized = Some(snapshot.clone());

        snapshot
    }

    pub fn is_finalized(&self) -> bool {
        self.tally.lock().finalized.is_some()
    }

    /// Outcomes that arrived after `finalize` and were left out.
    pub fn late_outcomes(&self) -> u64 {
        self.tally.lock().late_outcomes
    }
}
