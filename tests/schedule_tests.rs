use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use hono_load::schedule::{BurstSchedule, Schedule, WaitPolicy};

#[test]
fn test_uniform_jitter_stays_in_bounds() {
    let policy = WaitPolicy::Uniform { ratio: 0.2 };
    let base = Duration::from_secs(10);
    let mut rng = StdRng::seed_from_u64(42);

    let mut below = 0;
    let mut above = 0;
    for _ in 0..10_000 {
        let wait = policy.next_wait(base, &mut rng);
        assert!(wait >= Duration::from_secs(8), "{:?} below bound", wait);
        assert!(wait <= Duration::from_secs(12), "{:?} above bound", wait);

        if wait < base {
            below += 1;
        } else {
            above += 1;
        }
    }

    // Both sides of the base interval are actually used.
    assert!(below > 4_000 && above > 4_000);
}

#[test]
fn test_poisson_waits_are_clamped() {
    let policy = WaitPolicy::Poisson {
        mean: None,
        min: Duration::from_millis(100),
        max: Duration::from_secs(30),
    };
    let base = Duration::from_secs(10);
    let mut rng = StdRng::seed_from_u64(7);

    let mut total = 0.0;
    for _ in 0..10_000 {
        let wait = policy.next_wait(base, &mut rng);
        assert!(wait >= Duration::from_millis(100));
        assert!(wait <= Duration::from_secs(30));
        total += wait.as_secs_f64();
    }

    // Clamping at 3x the mean trims the tail a little.
    let mean = total / 10_000.0;
    assert!(mean > 8.5 && mean < 10.5, "mean {}", mean);
}

#[test]
fn test_poisson_rate_overrides_base_interval() {
    // 10 arrivals per minute, a 6s mean, whatever the base interval says.
    let policy = WaitPolicy::Poisson {
        mean: Some(Duration::from_secs(6)),
        min: Duration::from_millis(100),
        max: Duration::from_secs(300),
    };
    let mut rng = StdRng::seed_from_u64(19);

    let total: f64 = (0..10_000)
        .map(|_| policy.next_wait(Duration::from_secs(60), &mut rng).as_secs_f64())
        .sum();

    let mean = total / 10_000.0;
    assert!(mean > 5.5 && mean < 6.5, "mean {}", mean);
}

#[test]
fn test_fixed_policy_returns_base() {
    let mut rng = StdRng::seed_from_u64(1);
    let base = Duration::from_millis(1_500);

    assert_eq!(WaitPolicy::Fixed.next_wait(base, &mut rng), base);
    assert_eq!(
        WaitPolicy::Uniform { ratio: 0.0 }.next_wait(base, &mut rng),
        base
    );
}

#[test]
fn test_burst_window_shortens_interval() {
    let schedule = Schedule {
        interval: Duration::from_secs(10),
        policy: WaitPolicy::Fixed,
        burst: Some(BurstSchedule {
            multiplier: 5.0,
            duration: Duration::from_secs(60),
            frequency: Duration::from_secs(600),
        }),
    };

    assert_eq!(schedule.base_interval(Duration::ZERO), Duration::from_secs(10));
    assert_eq!(
        schedule.base_interval(Duration::from_secs(599)),
        Duration::from_secs(10)
    );
    assert_eq!(
        schedule.base_interval(Duration::from_secs(600)),
        Duration::from_secs(2)
    );
    assert_eq!(
        schedule.base_interval(Duration::from_secs(659)),
        Duration::from_secs(2)
    );
    assert_eq!(
        schedule.base_interval(Duration::from_secs(660)),
        Duration::from_secs(10)
    );
    assert_eq!(
        schedule.base_interval(Duration::from_secs(1_270)),
        Duration::from_secs(2)
    );
}

#[test]
fn test_schedule_without_burst_is_constant() {
    let schedule = Schedule::fixed(Duration::from_secs(3));
    let mut rng = StdRng::seed_from_u64(3);

    for secs in [0, 100, 10_000] {
        assert_eq!(
            schedule.next_wait(Duration::from_secs(secs), &mut rng),
            Duration::from_secs(3)
        );
    }
}
