use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Transport a simulated device speaks to its protocol adapter.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Mqtt,
    Http,
    Coap,
    Amqp,
    Lora,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Mqtt,
        Protocol::Http,
        Protocol::Coap,
        Protocol::Amqp,
        Protocol::Lora,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Http => "http",
            Protocol::Coap => "coap",
            Protocol::Amqp => "amqp",
            Protocol::Lora => "lora",
        }
    }

    /// Only MQTT and HTTP have a sender; the rest fail fast when connected.
    pub fn is_supported(&self) -> bool {
        matches!(self, Protocol::Mqtt | Protocol::Http)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mqtt" => Ok(Protocol::Mqtt),
            "http" | "https" => Ok(Protocol::Http),
            "coap" => Ok(Protocol::Coap),
            "amqp" => Ok(Protocol::Amqp),
            "lora" | "lorawan" => Ok(Protocol::Lora),
            other => Err(LoadError::Config(format!(
                "unknown protocol '{}', expected one of mqtt, http, coap, amqp, lora",
                other
            ))),
        }
    }
}

/// A provisioned device identity. Each device is driven by exactly one worker.
#[derive(Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub tenant_id: String,
    pub auth_id: String,
    credential: String,
    pub protocol: Protocol,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        let id = id.into();

        Self {
            auth_id: id.clone(),
            id,
            tenant_id: tenant_id.into(),
            credential: credential.into(),
            protocol: Protocol::default(),
        }
    }

    pub fn with_auth_id(mut self, auth_id: impl Into<String>) -> Self {
        self.auth_id = auth_id.into();
        self
    }

    /// Consumes the device and returns it bound to `protocol`.
    pub fn assign(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Adapter login in the `auth-id@tenant` form.
    pub fn username(&self) -> String {
        format!("{}@{}", self.auth_id, self.tenant_id)
    }

    pub fn check(&self) -> Result<(), LoadError> {
        if self.id.trim().is_empty()
            || self.tenant_id.trim().is_empty()
            || self.auth_id.trim().is_empty()
            || self.credential.is_empty()
        {
            return Err(LoadError::InvalidCredential(self.id.clone()));
        }

        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("auth_id", &self.auth_id)
            .field("credential", &"<redacted>")
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Splits `total` into `parts` sizes differing by at most one, larger shares first.
pub fn split_evenly(total: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }

    let base = total / parts;
    let remainder = total % parts;

    (0..parts)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}
