use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::config::AdapterConfig;
use crate::device::{Device, Protocol};
use crate::error::LoadError;
use crate::message::{MessageType, Telemetry};

mod http;
mod mqtt;

pub use http::{build_client, HttpSender};
pub use mqtt::MqttSender;

/// One open channel from a device to its protocol adapter.
#[async_trait]
pub trait ProtocolSender: Send {
    /// Makes exactly one delivery attempt.
    async fn send(&mut self, payload: &Telemetry) -> Result<(), LoadError>;

    async fn close(&mut self) {}
}

/// Creates the sender a device uses for the whole run.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<Box<dyn ProtocolSender>, LoadError>;
}

/// Production connector, dispatching on the device's protocol.
pub struct Transports {
    adapters: Arc<AdapterConfig>,
    message_type: MessageType,
    http: reqwest::Client,
}

impl Transports {
    pub fn new(adapters: AdapterConfig, message_type: MessageType) -> Result<Self, LoadError> {
        let http = build_client(&adapters)?;

        Ok(Self {
            adapters: Arc::new(adapters),
            message_type,
            http,
        })
    }
}

#[async_trait]
impl Connector for Transports {
    async fn connect(&self, device: &Device) -> Result<Box<dyn ProtocolSender>, LoadError> {
        device.check()?;

        debug!("Connecting device {} over {}", device.id, device.protocol);

        match device.protocol {
            Protocol::Mqtt => {
                let sender = MqttSender::connect(&self.adapters, device, self.message_type).await?;
                Ok(Box::new(sender))
            }
            Protocol::Http => Ok(Box::new(HttpSender::new(
                self.http.clone(),
                &self.adapters,
                device,
                self.message_type,
            ))),
            Protocol::Coap | Protocol::Amqp | Protocol::Lora => {
                Err(LoadError::ProtocolUnsupported(device.protocol))
            }
        }
    }
}
