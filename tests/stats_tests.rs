use std::sync::Arc;
use std::time::Duration;

use hono_load::device::{Device, Protocol};
use hono_load::error::ErrorKind;
use hono_load::message::MessageOutcome;
use hono_load::metrics::RunMetrics;
use hono_load::stats::Aggregator;

fn device(protocol: Protocol) -> Device {
    Device::new("device-1", "tenant-a", "secret").assign(protocol)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_records_are_conserved() {
    let aggregator = Arc::new(Aggregator::new(1_000));
    let mut handles = Vec::new();

    for task in 0..32 {
        let aggregator = aggregator.clone();
        handles.push(tokio::spawn(async move {
            let protocol = if task % 2 == 0 { Protocol::Mqtt } else { Protocol::Http };
            let device = device(protocol);

            for i in 0..1_000 {
                let outcome = if i % 4 == 0 {
                    MessageOutcome::failure(&device, ErrorKind::Timeout)
                } else {
                    MessageOutcome::success(&device, Duration::from_millis(i % 100))
                };
                aggregator.record(outcome);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.total(), 32_000);
    assert_eq!(snapshot.sent, 24_000);
    assert_eq!(snapshot.failed, 8_000);
    assert_eq!(snapshot.errors[&ErrorKind::Timeout], 8_000);
    assert_eq!(snapshot.latency.count, 24_000);
    assert_eq!(snapshot.latency.retained, 1_000);

    let per_protocol: u64 = snapshot.protocols.values().map(|p| p.total()).sum();
    assert_eq!(per_protocol, snapshot.total());
    assert_eq!(snapshot.protocols[&Protocol::Mqtt].total(), 16_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_during_concurrent_records_are_consistent() {
    let aggregator = Arc::new(Aggregator::new(1_000));

    let reader = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            let mut last = 0;
            let mut seen = 0;

            loop {
                let snapshot = aggregator.snapshot();
                let total = snapshot.total();
                let per_protocol: u64 = snapshot.protocols.values().map(|p| p.total()).sum();

                assert!(total >= last, "total went from {} to {}", last, total);
                assert_eq!(per_protocol, total);
                assert_eq!(snapshot.sent + snapshot.failed, total);

                last = total;
                seen += 1;
                if total == 32_000 {
                    return seen;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let mut writers = Vec::new();
    for task in 0..32 {
        let aggregator = aggregator.clone();
        writers.push(tokio::spawn(async move {
            let protocol = if task % 2 == 0 { Protocol::Mqtt } else { Protocol::Http };
            let device = device(protocol);

            for i in 0..1_000 {
                let outcome = if i % 4 == 0 {
                    MessageOutcome::failure(&device, ErrorKind::Timeout)
                } else {
                    MessageOutcome::success(&device, Duration::from_millis(i % 100))
                };
                aggregator.record(outcome);

                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    for writer in writers {
        writer.await.unwrap();
    }

    let seen = reader.await.unwrap();
    assert!(seen >= 1);
    assert_eq!(aggregator.snapshot().total(), 32_000);
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let aggregator = Aggregator::new(100);
    let device = device(Protocol::Mqtt);

    aggregator.record(MessageOutcome::success(&device, Duration::from_millis(10)));
    aggregator.record(MessageOutcome::failure(&device, ErrorKind::Rejected));

    let first = aggregator.finalize();
    let second = aggregator.finalize();

    assert!(first.finalized);
    assert_eq!(first, second);
    assert_eq!(aggregator.snapshot(), first);
    assert!(aggregator.is_finalized());
}

#[tokio::test]
async fn test_records_after_finalize_are_ignored() {
    let aggregator = Aggregator::new(100);
    let device = device(Protocol::Http);

    aggregator.record(MessageOutcome::success(&device, Duration::from_millis(5)));
    let final_snapshot = aggregator.finalize();

    aggregator.record(MessageOutcome::success(&device, Duration::from_millis(5)));
    aggregator.record(MessageOutcome::failure(&device, ErrorKind::Transport));
    aggregator.record_forced_cancellation(&device.id, device.protocol);

    assert_eq!(aggregator.snapshot(), final_snapshot);
    assert_eq!(aggregator.late_outcomes(), 2);
    assert_eq!(final_snapshot.sent, 1);
    assert_eq!(final_snapshot.forced_cancellations, 0);
}

#[tokio::test]
async fn test_forced_cancellations_are_not_failures() {
    let aggregator = Aggregator::new(100);
    aggregator.register_devices(Protocol::Mqtt, 2);
    aggregator.record_forced_cancellation("device-1", Protocol::Mqtt);

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.forced_cancellations, 1);
    assert_eq!(snapshot.protocols[&Protocol::Mqtt].devices, 2);
    assert_eq!(snapshot.protocols[&Protocol::Mqtt].forced_cancellations, 1);
}

#[tokio::test]
async fn test_latency_bands_and_intervals() {
    let aggregator = Aggregator::new(100);
    let device = device(Protocol::Mqtt);

    for ms in [10, 60, 150, 250, 600, 1_500] {
        aggregator.record(MessageOutcome::success(&device, Duration::from_millis(ms)));
    }
    aggregator.record_interval(Duration::from_secs(8));
    aggregator.record_interval(Duration::from_secs(12));

    let snapshot = aggregator.snapshot();
    let bands = &snapshot.latency_bands;
    assert_eq!(
        (
            bands.over_50ms,
            bands.over_100ms,
            bands.over_200ms,
            bands.over_500ms,
            bands.over_1000ms
        ),
        (1, 1, 1, 1, 1)
    );
    assert!((snapshot.latency.min_ms - 10.0).abs() < 1e-9);
    assert!((snapshot.latency.max_ms - 1_500.0).abs() < 1e-9);

    assert_eq!(snapshot.intervals.count, 2);
    assert!((snapshot.intervals.mean_secs - 10.0).abs() < 1e-9);
    assert!((snapshot.intervals.std_dev_secs - 2.0).abs() < 1e-9);
    assert!((snapshot.intervals.rate_per_minute - 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_metrics_mirror_outcomes() {
    let metrics = Arc::new(RunMetrics::new().unwrap());
    let aggregator = Aggregator::new(100).with_metrics(metrics.clone());
    let device = device(Protocol::Http);

    aggregator.record(MessageOutcome::success(&device, Duration::from_millis(20)));
    aggregator.record(MessageOutcome::failure(&device, ErrorKind::Unauthorized));
    aggregator.record_forced_cancellation(&device.id, device.protocol);

    let text = metrics.encode().unwrap();
    assert!(text.contains("hono_load_messages_total{protocol=\"http\",result=\"success\"} 1"));
    assert!(text.contains("hono_load_messages_total{protocol=\"http\",result=\"failure\"} 1"));
    assert!(text.contains("hono_load_forced_cancellations_total 1"));
}
