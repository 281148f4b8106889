use std::sync::Arc;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::device::{Device, Protocol};
use crate::message::{MessageOutcome, Telemetry};
use crate::schedule::Schedule;
use crate::sender::{Connector, ProtocolSender};
use crate::stats::Aggregator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Sending,
    Waiting,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Cancelled,
    LimitReached,
    /// The sender could not be built or reported a failure that cannot clear.
    SenderUnavailable,
}

/// How a worker ended, returned from its task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub device_id: String,
    pub protocol: Protocol,
    pub attempts: u64,
    pub reason: ExitReason,
}

/// Drives one device: send, record, wait, until cancelled.
pub struct DeviceWorker {
    device: Device,
    connector: Arc<dyn Connector>,
    aggregator: Arc<Aggregator>,
    schedule: Schedule,
    shutdown: CancellationToken,
    message_limit: Option<u64>,
    rng: StdRng,
    state: WorkerState,
    attempts: u64,
}

impl DeviceWorker {
    pub fn new(
        device: Device,
        connector: Arc<dyn Connector>,
        aggregator: Arc<Aggregator>,
        schedule: Schedule,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            device,
            connector,
            aggregator,
            schedule,
            shutdown,
            message_limit: None,
            rng: StdRng::from_entropy(),
            state: WorkerState::Idle,
            attempts: 0,
        }
    }

    pub fn with_message_limit(mut self, limit: Option<u64>) -> Self {
        self.message_limit = limit;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn run(mut self) -> WorkerExit {
        let connector = self.connector.clone();

        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            connected = connector.connect(&self.device) => Some(connected),
        };

        let mut sender = match connected {
            None => return self.exit(ExitReason::Cancelled),
            Some(Ok(sender)) => sender,
            Some(Err(e)) => {
                warn!("Device {} has no usable sender: {}", self.device.id, e);
                self.aggregator
                    .record(MessageOutcome::failure(&self.device, e.kind()));
                self.attempts += 1;
                return self.exit(ExitReason::SenderUnavailable);
            }
        };

        let reason = self.send_loop(sender.as_mut()).await;
        sender.close().await;

        self.exit(reason)
    }

    async fn send_loop(&mut self, sender: &mut dyn ProtocolSender) -> ExitReason {
        let started = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                return ExitReason::Cancelled;
            }

            self.state = WorkerState::Sending;
            self.attempts += 1;
            let payload = Telemetry::random(&self.device, self.attempts, &mut self.rng);

            let sent_at = Instant::now();
            match sender.send(&payload).await {
                Ok(()) => {
                    self.aggregator
                        .record(MessageOutcome::success(&self.device, sent_at.elapsed()));
                }
                Err(e) => {
                    debug!("Device {} send #{} failed: {}", self.device.id, self.attempts, e);
                    let kind = e.kind();
                    self.aggregator
                        .record(MessageOutcome::failure(&self.device, kind));

                    if kind.is_terminal() {
                        return ExitReason::SenderUnavailable;
                    }
                }
            }

            if self.message_limit.map_or(false, |limit| self.attempts >= limit) {
                info!(
                    "Device {} reached its limit of {} messages",
                    self.device.id, self.attempts
                );
                return ExitReason::LimitReached;
            }

            let wait = self.schedule.next_wait(started.elapsed(), &mut self.rng);
            self.aggregator.record_interval(wait);

            self.state = WorkerState::Waiting;
            let cancelled = tokio::select! {
                _ = self.shutdown.cancelled() => true,
                _ = tokio::time::sleep(wait) => false,
            };

            if cancelled {
                return ExitReason::Cancelled;
            }
        }
    }

    fn exit(&mut self, reason: ExitReason) -> WorkerExit {
        self.state = WorkerState::Stopped;
        debug!(
            "Device {} stopped after {} attempts: {:?}",
            self.device.id, self.attempts, reason
        );

        WorkerExit {
            device_id: self.device.id.clone(),
            protocol: self.device.protocol,
            attempts: self.attempts,
            reason,
        }
    }
}
