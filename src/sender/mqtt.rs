use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::AdapterConfig;
use crate::device::Device;
use crate::error::{ErrorKind, LoadError};
use crate::message::{MessageType, Telemetry};

use super::ProtocolSender;

/// What the event-loop task reports back to the sender.
#[derive(Debug)]
enum Notice {
    Connected,
    Refused(ConnectReturnCode),
    PubAck,
    Lost(String),
}

pub struct MqttSender {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    ack_timeout: Duration,
    notices: mpsc::Receiver<Notice>,
    poller: JoinHandle<()>,
    lost: Option<String>,
}

impl MqttSender {
    /// Opens the connection and waits for the broker's CONNACK.
    pub async fn connect(
        adapters: &AdapterConfig,
        device: &Device,
        message_type: MessageType,
    ) -> Result<Self, LoadError> {
        let mut options = MqttOptions::new(
            device.id.clone(),
            adapters.mqtt_host.clone(),
            adapters.mqtt_port,
        );
        options.set_credentials(device.username(), device.credential());
        options.set_keep_alive(adapters.mqtt_keepalive());

        if adapters.mqtt_tls {
            options.set_transport(tls_transport(adapters)?);
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        let (tx, mut notices) = mpsc::channel(16);
        let poller = tokio::spawn(poll_events(eventloop, tx));

        let connect_timeout = adapters.mqtt_connect_timeout();
        let connected = match timeout(connect_timeout, notices.recv()).await {
            Ok(Some(Notice::Connected)) => Ok(()),
            Ok(Some(Notice::Refused(code))) => Err(refusal(code)),
            Ok(Some(Notice::Lost(reason))) => Err(LoadError::send(ErrorKind::Connect, reason)),
            Ok(Some(Notice::PubAck)) | Ok(None) => Err(LoadError::send(
                ErrorKind::Connect,
                "connection closed before CONNACK",
            )),
            Err(_) => Err(LoadError::send(
                ErrorKind::Timeout,
                format!("no CONNACK within {:?}", connect_timeout),
            )),
        };

        if let Err(e) = connected {
            poller.abort();
            return Err(e);
        }

        debug!("MQTT connected for device {}", device.id);

        // Telemetry is fire-and-forget; events are acknowledged.
        let qos = match message_type {
            MessageType::Telemetry => QoS::AtMostOnce,
            MessageType::Event => QoS::AtLeastOnce,
        };

        Ok(Self {
            client,
            topic: message_type.endpoint().to_string(),
            qos,
            ack_timeout: adapters.request_timeout(),
            notices,
            poller,
            lost: None,
        })
    }

    fn drain_notices(&mut self) {
        loop {
            match self.notices.try_recv() {
                Ok(Notice::Lost(reason)) => self.lost = Some(reason),
                Ok(Notice::Refused(code)) => self.lost = Some(format!("refused: {:?}", code)),
                Ok(Notice::Connected) | Ok(Notice::PubAck) => {}
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.lost.get_or_insert_with(|| "event loop stopped".to_string());
                    return;
                }
            }
        }
    }

    async fn await_puback(&mut self) -> Result<(), LoadError> {
        let deadline = Instant::now() + self.ack_timeout;

        loop {
            match timeout_at(deadline, self.notices.recv()).await {
                Ok(Some(Notice::PubAck)) => return Ok(()),
                Ok(Some(Notice::Connected)) => continue,
                Ok(Some(Notice::Refused(code))) => {
                    self.lost = Some(format!("refused: {:?}", code));
                    return Err(refusal(code));
                }
                Ok(Some(Notice::Lost(reason))) => {
                    self.lost = Some(reason.clone());
                    return Err(LoadError::send(ErrorKind::Transport, reason));
                }
                Ok(None) => {
                    self.lost = Some("event loop stopped".to_string());
                    return Err(LoadError::send(ErrorKind::Transport, "event loop stopped"));
                }
                Err(_) => return Err(LoadError::send(ErrorKind::Timeout, "no PUBACK received")),
            }
        }
    }
}

#[async_trait]
impl ProtocolSender for MqttSender {
    async fn send(&mut self, payload: &Telemetry) -> Result<(), LoadError> {
        self.drain_notices();
        if let Some(reason) = &self.lost {
            return Err(LoadError::send(ErrorKind::Transport, reason));
        }

        let bytes = payload.to_bytes()?;
        self.client
            .publish(self.topic.as_str(), self.qos, false, bytes)
            .await
            .map_err(|e| LoadError::send(ErrorKind::Transport, e))?;

        if self.qos == QoS::AtLeastOnce {
            self.await_puback().await?;
        }

        Ok(())
    }

    async fn close(&mut self) {
        if self.lost.is_none() {
            if let Err(e) = self.client.disconnect().await {
                debug!("MQTT disconnect failed: {}", e);
            }
        }
        self.poller.abort();
    }
}

impl Drop for MqttSender {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn poll_events(mut eventloop: EventLoop, notices: mpsc::Sender<Notice>) {
    loop {
        let notice = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    Notice::Connected
                } else {
                    Notice::Refused(ack.code)
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => Notice::PubAck,
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = notices.send(Notice::Refused(code)).await;
                return;
            }
            Err(e) => {
                let _ = notices.send(Notice::Lost(e.to_string())).await;
                return;
            }
        };

        if notices.send(notice).await.is_err() {
            return;
        }
    }
}

fn refusal(code: ConnectReturnCode) -> LoadError {
    let kind = match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ErrorKind::Unauthorized
        }
        _ => ErrorKind::Connect,
    };

    LoadError::send(kind, format!("connection refused: {:?}", code))
}

fn tls_transport(adapters: &AdapterConfig) -> Result<Transport, LoadError> {
    if !adapters.verify_tls {
        warn!("MQTT over TLS always verifies the broker certificate");
    }

    match &adapters.ca_file {
        Some(path) => Ok(Transport::tls(fs::read(path)?, None, None)),
        None => Ok(Transport::tls_with_default_config()),
    }
}
