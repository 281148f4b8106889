use std::str::FromStr;
use std::time::Duration;

use log::warn;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    #[default]
    Fixed,
    Uniform,
    Poisson,
}

impl FromStr for JitterMode {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" | "none" => Ok(JitterMode::Fixed),
            "uniform" => Ok(JitterMode::Uniform),
            "poisson" | "exponential" => Ok(JitterMode::Poisson),
            other => Err(LoadError::Config(format!(
                "unknown jitter mode '{}', expected fixed, uniform or poisson",
                other
            ))),
        }
    }
}

/// How the wait between two sends of the same device is drawn.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WaitPolicy {
    Fixed,
    /// `base * (1 + u)` with `u` uniform in `[-ratio, ratio]`.
    Uniform { ratio: f64 },
    /// Exponential inter-arrival times clamped to `[min, max]`. The mean is
    /// `mean` when a rate was configured, the base interval otherwise.
    Poisson {
        mean: Option<Duration>,
        min: Duration,
        max: Duration,
    },
}

impl WaitPolicy {
    pub fn next_wait<R: Rng + ?Sized>(&self, base: Duration, rng: &mut R) -> Duration {
        match *self {
            WaitPolicy::Fixed => base,
            WaitPolicy::Uniform { ratio } => {
                if ratio <= 0.0 || base.is_zero() {
                    return base;
                }

                let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
                base.mul_f64(factor.max(0.0))
            }
            WaitPolicy::Poisson { mean, min, max } => {
                let base = mean.unwrap_or(base);
                if base.is_zero() {
                    return min;
                }

                match Exp::new(1.0 / base.as_secs_f64()) {
                    Ok(exp) => Duration::try_from_secs_f64(exp.sample(rng))
                        .unwrap_or(max)
                        .clamp(min, max),
                    Err(e) => {
                        warn!("Falling back to base interval, bad exponential rate: {}", e);
                        base
                    }
                }
            }
        }
    }
}

/// Periodic load spikes: every `frequency` of normal load is followed by
/// `duration` of load multiplied by `multiplier`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BurstSchedule {
    pub multiplier: f64,
    pub duration: Duration,
    pub frequency: Duration,
}

impl BurstSchedule {
    pub fn is_active(&self, elapsed: Duration) -> bool {
        let cycle = (self.frequency + self.duration).as_nanos();
        if cycle == 0 || self.duration.is_zero() {
            return false;
        }

        elapsed.as_nanos() % cycle >= self.frequency.as_nanos()
    }
}

/// Per-worker send cadence. Copied into every worker, never shared.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Schedule {
    pub interval: Duration,
    pub policy: WaitPolicy,
    pub burst: Option<BurstSchedule>,
}

impl Schedule {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            policy: WaitPolicy::Fixed,
            burst: None,
        }
    }

    /// Nominal interval at `elapsed` into the run, before jitter.
    pub fn base_interval(&self, elapsed: Duration) -> Duration {
        match self.burst {
            Some(burst) if burst.multiplier > 0.0 && burst.is_active(elapsed) => {
                self.interval.div_f64(burst.multiplier)
            }
            _ => self.interval,
        }
    }

    pub fn next_wait<R: Rng + ?Sized>(&self, elapsed: Duration, rng: &mut R) -> Duration {
        self.policy.next_wait(self.base_interval(elapsed), rng)
    }
}
