use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::snapshot::LatencySummary;

/// Percentiles reported for latency samples.
pub const PERCENTILES: [f64; 5] = [50.0, 90.0, 95.0, 99.0, 99.9];

/// Exact count/sum/min/max plus a uniform random sample of at most `cap`
/// latencies (Algorithm R), so memory stays bounded on long runs.
#[derive(Debug)]
pub struct LatencyReservoir {
    cap: usize,
    seen: u64,
    total: Duration,
    min: Option<Duration>,
    max: Option<Duration>,
    samples: Vec<Duration>,
    rng: StdRng,
}

impl LatencyReservoir {
    pub fn new(cap: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            cap: cap.max(1),
            seen: 0,
            total: Duration::ZERO,
            min: None,
            max: None,
            samples: Vec::new(),
            rng,
        }
    }

    pub fn push(&mut self, latency: Duration) {
        self.seen += 1;
        self.total = self.total.saturating_add(latency);
        self.min = Some(self.min.map_or(latency, |min| min.min(latency)));
        self.max = Some(self.max.map_or(latency, |max| max.max(latency)));

        if self.samples.len() < self.cap {
            self.samples.push(latency);
            return;
        }

        let slot = self.rng.gen_range(0..self.seen);
        if slot < self.cap as u64 {
            self.samples[slot as usize] = latency;
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn retained(&self) -> usize {
        self.samples.len()
    }

    pub fn summary(&self) -> LatencySummary {
        if self.seen == 0 {
            return LatencySummary::default();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let at = |p: f64| percentile(&sorted, p).map_or(0.0, millis);

        LatencySummary {
            count: self.seen,
            retained: sorted.len(),
            min_ms: self.min.map_or(0.0, millis),
            max_ms: self.max.map_or(0.0, millis),
            mean_ms: millis(self.total) / self.seen as f64,
            p50_ms: at(PERCENTILES[0]),
            p90_ms: at(PERCENTILES[1]),
            p95_ms: at(PERCENTILES[2]),
            p99_ms: at(PERCENTILES[3]),
            p999_ms: at(PERCENTILES[4]),
        }
    }
}

/// Nearest-rank percentile over an ascending slice: `sorted[floor(p/100 * (n-1))]`.
pub fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() || !(p > 0.0 && p <= 100.0) {
        return None;
    }

    let index = ((p / 100.0) * (sorted.len() - 1) as f64) as usize;
    sorted.get(index).copied()
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_at_most_cap_samples() {
        let mut reservoir = LatencyReservoir::new(100, Some(1));
        for ms in 0..10_000u64 {
            reservoir.push(Duration::from_millis(ms));
        }

        let summary = reservoir.summary();
        assert_eq!(reservoir.retained(), 100);
        assert_eq!(summary.count, 10_000);
        assert_eq!(summary.min_ms, 0.0);
        assert_eq!(summary.max_ms, 9_999.0);
        assert!((summary.mean_ms - 4_999.5).abs() < 1e-6);
    }

    #[test]
    fn percentile_uses_floor_index() {
        let sorted: Vec<Duration> = (1..=10).map(Duration::from_millis).collect();

        assert_eq!(percentile(&sorted, 50.0), Some(Duration::from_millis(5)));
        assert_eq!(percentile(&sorted, 100.0), Some(Duration::from_millis(10)));
        assert_eq!(percentile(&sorted, 0.0), None);
        assert_eq!(percentile(&[], 50.0), None);
    }
}
