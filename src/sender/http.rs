use std::fs;

use async_trait::async_trait;
use log::warn;
use reqwest::{Certificate, StatusCode};

use crate::config::AdapterConfig;
use crate::device::Device;
use crate::error::{ErrorKind, LoadError};
use crate::message::{MessageType, Telemetry};

use super::ProtocolSender;

/// Shared HTTP client for the registry and the HTTP adapter.
pub fn build_client(adapters: &AdapterConfig) -> Result<reqwest::Client, LoadError> {
    let mut builder = reqwest::Client::builder().timeout(adapters.request_timeout());

    if let Some(path) = &adapters.ca_file {
        let pem = fs::read(path)?;
        let certificate =
            Certificate::from_pem(&pem).map_err(|e| LoadError::Config(e.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }

    if adapters.use_tls && !adapters.verify_tls {
        warn!("TLS certificate verification is disabled for HTTP connections");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|e| LoadError::Config(e.to_string()))
}

pub struct HttpSender {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl HttpSender {
    pub fn new(
        client: reqwest::Client,
        adapters: &AdapterConfig,
        device: &Device,
        message_type: MessageType,
    ) -> Self {
        Self {
            client,
            url: format!("{}/{}", adapters.http_adapter_url(), message_type.endpoint()),
            username: device.username(),
            password: device.credential().to_string(),
        }
    }
}

#[async_trait]
impl ProtocolSender for HttpSender {
    async fn send(&mut self, payload: &Telemetry) -> Result<(), LoadError> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(());
        }

        let kind = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Timeout,
            _ => ErrorKind::Rejected,
        };

        Err(LoadError::send(kind, format!("HTTP {}", status)))
    }
}
