#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use hono_load::device::Device;
use hono_load::error::{ErrorKind, LoadError};
use hono_load::message::Telemetry;
use hono_load::registry::{Provisioned, Registry};
use hono_load::report::{Progress, ReportSink, RunReport};
use hono_load::sender::{Connector, ProtocolSender};

pub fn devices(n: usize) -> Vec<Device> {
    (0..n)
        .map(|i| Device::new(format!("device-{}", i), "tenant-a", "secret"))
        .collect()
}

/// Registry handing out `devices` of the `requested`, or failing outright.
pub struct FakeRegistry {
    pub devices: usize,
    pub fail: bool,
    pub delay: Option<Duration>,
}

impl FakeRegistry {
    pub fn with(devices: usize) -> Self {
        Self {
            devices,
            fail: false,
            delay: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            devices: 0,
            fail: true,
            delay: None,
        }
    }

    /// Answers only after `delay`.
    pub fn slow(devices: usize, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::with(devices)
        }
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn register(&self, _tenants: usize, requested: usize) -> Result<Provisioned, LoadError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail {
            return Err(LoadError::provisioning("registry unreachable"));
        }

        Ok(Provisioned {
            tenants: vec!["tenant-a".to_string()],
            devices: devices(self.devices.min(requested)),
            requested,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Behaviour {
    AlwaysOk,
    /// Every n-th send of a device fails with `Rejected`.
    FailEvery(u64),
    /// First send succeeds, later ones never complete.
    Hang,
}

/// Connector whose senders follow a script and count what they saw.
pub struct ScriptedConnector {
    behaviour: Behaviour,
    pub sends: Arc<AtomicU64>,
    pub connects: Arc<AtomicU64>,
    reject: Vec<String>,
}

impl ScriptedConnector {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            sends: Arc::new(AtomicU64::new(0)),
            connects: Arc::new(AtomicU64::new(0)),
            reject: Vec::new(),
        }
    }

    /// Devices whose connect is refused as unauthorized.
    pub fn rejecting(mut self, device_ids: &[&str]) -> Self {
        self.reject = device_ids.iter().map(|id| id.to_string()).collect();
        self
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn ProtocolSender>, LoadError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if self.reject.contains(&device.id) {
            return Err(LoadError::send(ErrorKind::Unauthorized, "bad credentials"));
        }

        Ok(Box::new(ScriptedSender {
            behaviour: self.behaviour,
            count: 0,
            total: self.sends.clone(),
        }))
    }
}

struct ScriptedSender {
    behaviour: Behaviour,
    count: u64,
    total: Arc<AtomicU64>,
}

#[async_trait]
impl ProtocolSender for ScriptedSender {
    async fn send(&mut self, payload: &Telemetry) -> Result<(), LoadError> {
        // Validation round trips do not count towards the script.
        if payload.validation {
            return Ok(());
        }

        self.count += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        match self.behaviour {
            Behaviour::AlwaysOk => Ok(()),
            Behaviour::FailEvery(n) if self.count % n == 0 => {
                Err(LoadError::send(ErrorKind::Rejected, "scripted failure"))
            }
            Behaviour::FailEvery(_) => Ok(()),
            Behaviour::Hang if self.count > 1 => std::future::pending().await,
            Behaviour::Hang => Ok(()),
        }
    }
}

/// Keeps everything a run reported.
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<RunReport>>,
    pub ticks: Mutex<Vec<Progress>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().clone()
    }
}

impl ReportSink for RecordingSink {
    fn progress(&self, progress: &Progress) {
        self.ticks.lock().push(progress.clone());
    }

    fn final_report(&self, report: &RunReport) {
        self.reports.lock().push(report.clone());
    }
}
