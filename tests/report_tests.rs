use std::time::Duration;

use hono_load::device::{Device, Protocol};
use hono_load::error::ErrorKind;
use hono_load::message::MessageOutcome;
use hono_load::orchestrator::{RunStatus, StopReason};
use hono_load::report::{JsonFileSink, RunReport, SlaThresholds};
use hono_load::stats::Aggregator;

fn finished(latencies_ms: &[u64], failures: u64) -> Aggregator {
    let aggregator = Aggregator::new(1_000);
    let device = Device::new("device-1", "tenant-a", "secret").assign(Protocol::Http);

    for &ms in latencies_ms {
        aggregator.record(MessageOutcome::success(&device, Duration::from_millis(ms)));
    }
    for _ in 0..failures {
        aggregator.record(MessageOutcome::failure(&device, ErrorKind::Timeout));
    }

    aggregator
}

#[test]
fn test_sla_passes_within_thresholds() {
    let snapshot = finished(&[20; 100], 0).finalize();
    let sla = SlaThresholds::default().evaluate(&snapshot);

    assert!(sla.p95_ok && sla.p99_ok && sla.success_rate_ok);
    assert!(sla.passed);
}

#[test]
fn test_sla_flags_slow_and_failing_runs() {
    let mut latencies = vec![20; 90];
    latencies.extend([900; 10]);
    let snapshot = finished(&latencies, 5).finalize();

    let sla = SlaThresholds::default().evaluate(&snapshot);

    assert!(!sla.p95_ok);
    assert!(!sla.p99_ok);
    assert!(!sla.success_rate_ok);
    assert!(!sla.passed);
}

#[test]
fn test_sla_without_samples_only_checks_success_rate() {
    let snapshot = finished(&[], 0).finalize();
    assert!(SlaThresholds::default().evaluate(&snapshot).passed);

    let snapshot = finished(&[], 3).finalize();
    let sla = SlaThresholds::default().evaluate(&snapshot);
    assert!(sla.p95_ok && sla.p99_ok);
    assert!(!sla.success_rate_ok);
}

#[test]
fn test_alerts_need_enough_samples() {
    let sla = SlaThresholds::default();

    let few = finished(&[900; 9], 0).snapshot();
    assert!(sla.alerts(&few).is_empty());

    let fast = finished(&[20; 50], 0).snapshot();
    assert!(sla.alerts(&fast).is_empty());
}

#[test]
fn test_alerts_name_breached_percentiles() {
    let sla = SlaThresholds::default();

    let mut latencies = vec![20; 90];
    latencies.extend([900; 10]);
    let alerts = sla.alerts(&finished(&latencies, 0).snapshot());
    assert_eq!(alerts.len(), 2);
    assert!(alerts[0].starts_with("p95"));
    assert!(alerts[1].starts_with("p99"));

    let mut latencies = vec![20; 98];
    latencies.extend([600; 2]);
    let alerts = sla.alerts(&finished(&latencies, 0).snapshot());
    assert_eq!(alerts, vec!["p99 latency 600.0ms exceeds 500.0ms".to_string()]);
}

#[test]
fn test_json_sink_writes_report() {
    let snapshot = finished(&[15, 25], 1).finalize();
    let report = RunReport {
        status: RunStatus::Completed,
        stop_reason: StopReason::DurationElapsed,
        started_at: snapshot.started_at,
        tenants: 1,
        devices_provisioned: 1,
        devices_validated: 1,
        validation_failures: Vec::new(),
        sla: SlaThresholds::default().evaluate(&snapshot),
        snapshot,
    };

    let dir = std::env::temp_dir().join(format!("hono-load-report-{}", std::process::id()));
    let path = JsonFileSink::new(&dir).write(&report).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    let parsed: RunReport = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed.status, RunStatus::Completed);
    assert_eq!(parsed.snapshot.sent, 2);
    assert_eq!(parsed.snapshot.failed, 1);
    assert_eq!(parsed.sla.passed, report.sla.passed);
    assert!(text.contains("\"duration_elapsed\""));
    assert!(text.contains("\"timeout\": 1"));
}
