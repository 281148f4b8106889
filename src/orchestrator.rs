use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{LoadConfig, PartialPolicy};
use crate::device::{split_evenly, Device, Protocol};
use crate::error::LoadError;
use crate::message::Telemetry;
use crate::metrics::RunMetrics;
use crate::registry::Registry;
use crate::report::{Progress, ReportSink, RunReport};
use crate::sender::Connector;
use crate::stats::{Aggregator, StatisticsSnapshot};
use crate::worker::{DeviceWorker, WorkerExit};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Validating,
    Running,
    Stopping,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    Interrupted,
    WorkersFinished,
    SetupFailed(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailure {
    pub device_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub passed: Vec<Device>,
    pub failures: Vec<ValidationFailure>,
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    pub tenants: usize,
    pub provisioned: usize,
    pub devices_validated: usize,
    pub validation_failures: Vec<ValidationFailure>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Pending,
            started_at: None,
            stop_reason: None,
            tenants: 0,
            provisioned: 0,
            devices_validated: 0,
            validation_failures: Vec::new(),
        }
    }
}

/// Held by each worker task. Dropped when the task ends or is aborted.
struct WorkerSlot {
    metrics: Option<Arc<RunMetrics>>,
    _done: mpsc::Sender<()>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.decrement_active_workers();
        }
    }
}

struct Running {
    device_id: String,
    protocol: Protocol,
    handle: JoinHandle<WorkerExit>,
}

/// Owns one load test from provisioning to the final report.
pub struct LoadTest {
    config: Arc<LoadConfig>,
    registry: Arc<dyn Registry>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn ReportSink>,
    aggregator: Arc<Aggregator>,
    metrics: Option<Arc<RunMetrics>>,
    state: Mutex<RunState>,
    shutdown: CancellationToken,
    reported: AtomicBool,
}

impl LoadTest {
    pub fn new(
        config: LoadConfig,
        registry: Arc<dyn Registry>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let aggregator = Aggregator::with_seed(config.latency_sample_cap, config.seed);

        Self {
            config: Arc::new(config),
            registry,
            connector,
            sink,
            aggregator: Arc::new(aggregator),
            metrics: None,
            state: Mutex::new(RunState::default()),
            shutdown: CancellationToken::new(),
            reported: AtomicBool::new(false),
        }
    }

    /// Mirrors every recorded outcome into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        let aggregator = Aggregator::with_seed(self.config.latency_sample_cap, self.config.seed)
            .with_metrics(metrics.clone());

        self.aggregator = Arc::new(aggregator);
        self.metrics = Some(metrics);
        self
    }

    /// Cancelling this token stops the run as an interruption.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.aggregator.clone()
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state.lock().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    fn set_status(&self, status: RunStatus) {
        let mut state = self.state.lock();
        debug!("Run status {:?} -> {:?}", state.status, status);
        state.status = status;
    }

    /// Provisions tenants and devices and assigns each device a protocol.
    pub async fn setup(&self) -> Result<Vec<Device>, LoadError> {
        match self.provision().await {
            Ok(devices) => {
                self.set_status(RunStatus::Validating);
                Ok(devices)
            }
            Err(e) => {
                error!("Setup failed: {}", e);
                self.set_status(RunStatus::Failed);
                Err(e)
            }
        }
    }

    async fn provision(&self) -> Result<Vec<Device>, LoadError> {
        let provisioned = self
            .registry
            .register(self.config.tenants, self.config.devices)
            .await?;

        if provisioned.devices.is_empty() {
            return Err(LoadError::provisioning("registry returned no devices"));
        }

        if provisioned.is_partial() {
            let message = format!(
                "only {}/{} devices were provisioned",
                provisioned.devices.len(),
                provisioned.requested
            );

            match self.config.partial_provisioning {
                PartialPolicy::Abort => return Err(LoadError::provisioning(message)),
                PartialPolicy::Proceed => warn!("{}, continuing", message),
            }
        }

        {
            let mut state = self.state.lock();
            state.tenants = provisioned.tenants.len();
            state.provisioned = provisioned.devices.len();
        }

        Ok(partition(provisioned.devices, &self.config.protocols)
            .into_iter()
            .flat_map(|(_, devices)| devices)
            .collect())
    }

    /// One connect and one send per device. Devices that fail are left out.
    pub async fn validate(&self, devices: Vec<Device>) -> ValidationResult {
        if !self.config.validate_devices {
            info!("Device validation disabled, using all {} devices", devices.len());
            return ValidationResult {
                passed: devices,
                failures: Vec::new(),
            };
        }

        info!("Validating {} devices", devices.len());

        let checked: Vec<(Device, Result<(), LoadError>)> = stream::iter(devices)
            .map(|device| async move {
                let result = self.validate_device(&device).await;
                (device, result)
            })
            .buffered(self.config.registration_concurrency.max(1))
            .collect()
            .await;

        let mut result = ValidationResult::default();
        for (device, outcome) in checked {
            match outcome {
                Ok(()) => result.passed.push(device),
                Err(e) => {
                    warn!("Device {} failed validation: {}", device.id, e);
                    result.failures.push(ValidationFailure {
                        device_id: device.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "{} devices passed validation, {} failed",
            result.passed.len(),
            result.failures.len()
        );
        self.state.lock().validation_failures = result.failures.clone();

        result
    }

    async fn validate_device(&self, device: &Device) -> Result<(), LoadError> {
        let mut sender = self.connector.connect(device).await?;
        let result = sender.send(&Telemetry::validation(device)).await;
        sender.close().await;

        result
    }

    /// Drives one worker per device until the duration elapses, the run is
    /// interrupted or every worker stops on its own.
    pub async fn run(&self, devices: Vec<Device>) -> StatisticsSnapshot {
        self.drive(devices).await.snapshot
    }

    /// Setup, validation and run. Always produces the final report. An
    /// interrupt before the run starts ends it without spawning workers.
    pub async fn execute(&self) -> RunReport {
        let setup = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => None,
            setup = self.setup() => Some(setup),
        };

        let devices = match setup {
            None => return self.abandon("setup"),
            Some(Ok(devices)) => devices,
            Some(Err(e)) => return self.fail(e.to_string()),
        };

        let validated = tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => None,
            validated = self.validate(devices) => Some(validated),
        };

        let validated = match validated {
            None => return self.abandon("validation"),
            Some(validated) => validated,
        };
        if validated.passed.is_empty() {
            return self.fail("no device passed validation".to_string());
        }

        self.drive(validated.passed).await
    }

    async fn drive(&self, devices: Vec<Device>) -> RunReport {
        let groups = partition(devices, &self.config.protocols);
        let total: usize = groups.iter().map(|(_, devices)| devices.len()).sum();

        self.aggregator.mark_started();
        {
            let mut state = self.state.lock();
            state.status = RunStatus::Running;
            state.started_at = Some(Utc::now());
            state.devices_validated = total;
        }

        info!(
            "Starting {} workers at {:.1}s interval",
            total, self.config.message_interval
        );

        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let workers = self.spawn_workers(groups, done_tx);

        let reason = self.wait_for_stop(&workers, &mut done_rx).await;
        info!("Stopping load test: {:?}", reason);

        {
            let mut state = self.state.lock();
            state.status = RunStatus::Stopping;
            state.stop_reason = Some(reason);
        }

        self.shutdown.cancel();
        self.join_workers(workers).await;

        let snapshot = self.aggregator.finalize();
        self.set_status(RunStatus::Completed);

        self.report(snapshot)
    }

    fn spawn_workers(
        &self,
        groups: Vec<(Protocol, Vec<Device>)>,
        done: mpsc::Sender<()>,
    ) -> Vec<Running> {
        let schedule = self.config.schedule();
        let mut workers = Vec::new();

        for (protocol, devices) in groups {
            info!("{} devices on {}", devices.len(), protocol);
            self.aggregator.register_devices(protocol, devices.len());

            for device in devices {
                let device_id = device.id.clone();
                let mut worker = DeviceWorker::new(
                    device,
                    self.connector.clone(),
                    self.aggregator.clone(),
                    schedule,
                    self.shutdown.clone(),
                )
                .with_message_limit(self.config.max_messages_per_device);

                if let Some(seed) = self.config.seed {
                    worker = worker.with_seed(seed.wrapping_add(workers.len() as u64 + 1));
                }

                if let Some(metrics) = &self.metrics {
                    metrics.increment_active_workers();
                }
                let slot = WorkerSlot {
                    metrics: self.metrics.clone(),
                    _done: done.clone(),
                };

                let handle = tokio::spawn(async move {
                    let _slot = slot;
                    worker.run().await
                });

                workers.push(Running {
                    device_id,
                    protocol,
                    handle,
                });
            }
        }

        workers
    }

    async fn wait_for_stop(
        &self,
        workers: &[Running],
        done: &mut mpsc::Receiver<()>,
    ) -> StopReason {
        // A limit beyond the clock's range never elapses.
        let deadline = self
            .config
            .duration_limit()
            .and_then(|d| Instant::now().checked_add(d));
        let mut ticker = self.config.report_every().and_then(|every| {
            let start = Instant::now().checked_add(every)?;
            let mut ticker = time::interval_at(start, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            Some(ticker)
        });
        let mut previous = self.aggregator.snapshot();

        loop {
            tokio::select! {
                // An interrupt wins when it races the duration timer.
                biased;

                _ = self.shutdown.cancelled() => return StopReason::Interrupted,
                _ = sleep_until(deadline) => return StopReason::DurationElapsed,
                None = done.recv() => return StopReason::WorkersFinished,
                _ = tick(&mut ticker) => {
                    let active = workers.iter().filter(|w| !w.handle.is_finished()).count();
                    previous = self.progress(previous, active);
                }
            }
        }
    }

    fn progress(&self, previous: StatisticsSnapshot, workers: usize) -> StatisticsSnapshot {
        let snapshot = self.aggregator.snapshot();
        let secs = snapshot
            .elapsed
            .saturating_sub(previous.elapsed)
            .as_secs_f64();

        let rate = |now: u64, before: u64| {
            if secs > 0.0 {
                now.saturating_sub(before) as f64 / secs
            } else {
                0.0
            }
        };

        for alert in self.config.sla.alerts(&snapshot) {
            warn!("Performance alert: {}", alert);
        }

        let progress = Progress {
            sent_rate: rate(snapshot.sent, previous.sent),
            failed_rate: rate(snapshot.failed, previous.failed),
            workers: workers as i64,
            snapshot,
        };
        self.sink.progress(&progress);

        progress.snapshot
    }

    /// Waits for every worker until one shared deadline, then aborts the rest.
    async fn join_workers(&self, workers: Vec<Running>) {
        let grace = self.config.grace_period();
        let deadline = Instant::now().checked_add(grace);
        let mut forced = 0;

        for mut worker in workers {
            let joined = match deadline {
                Some(deadline) => time::timeout_at(deadline, &mut worker.handle).await,
                None => Ok((&mut worker.handle).await),
            };

            match joined {
                Ok(Ok(exit)) => debug!("Worker {} exited: {:?}", exit.device_id, exit.reason),
                Ok(Err(e)) => error!("Worker {} did not finish: {}", worker.device_id, e),
                Err(_) => {
                    worker.handle.abort();
                    self.aggregator
                        .record_forced_cancellation(&worker.device_id, worker.protocol);
                    forced += 1;
                }
            }
        }

        if forced > 0 {
            warn!(
                "{} workers ignored cancellation for {:?} and were aborted",
                forced, grace
            );
        }
    }

    fn abandon(&self, phase: &str) -> RunReport {
        warn!("Interrupted during {}, no workers were started", phase);
        self.end_early(StopReason::Interrupted)
    }

    fn fail(&self, reason: String) -> RunReport {
        error!("Load test failed: {}", reason);
        self.end_early(StopReason::SetupFailed(reason))
    }

    fn end_early(&self, reason: StopReason) -> RunReport {
        {
            let mut state = self.state.lock();
            state.status = RunStatus::Failed;
            state.stop_reason = Some(reason);
        }

        let snapshot = self.aggregator.finalize();
        self.report(snapshot)
    }

    /// Builds the final report and hands it to the sink the first time only.
    fn report(&self, snapshot: StatisticsSnapshot) -> RunReport {
        let state = self.state();
        let report = RunReport {
            status: state.status,
            stop_reason: state
                .stop_reason
                .unwrap_or(StopReason::WorkersFinished),
            started_at: state.started_at.unwrap_or(snapshot.started_at),
            tenants: state.tenants,
            devices_provisioned: state.provisioned,
            devices_validated: state.devices_validated,
            validation_failures: state.validation_failures,
            sla: self.config.sla.evaluate(&snapshot),
            snapshot,
        };

        if self.reported.swap(true, Ordering::SeqCst) {
            warn!("Final report already emitted, not emitting again");
        } else {
            self.sink.final_report(&report);
        }

        report
    }
}

/// Splits `devices` evenly over `protocols` in order, the first protocols
/// taking the remainder. No protocols means everything runs over MQTT.
pub fn partition(devices: Vec<Device>, protocols: &[Protocol]) -> Vec<(Protocol, Vec<Device>)> {
    let fallback = [Protocol::Mqtt];
    let protocols = if protocols.is_empty() {
        &fallback[..]
    } else {
        protocols
    };

    let sizes = split_evenly(devices.len(), protocols.len());
    let mut devices = devices.into_iter();

    protocols
        .iter()
        .zip(sizes)
        .map(|(&protocol, size)| {
            let assigned = devices
                .by_ref()
                .take(size)
                .map(|device| device.assign(protocol))
                .collect();
            (protocol, assigned)
        })
        .collect()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
