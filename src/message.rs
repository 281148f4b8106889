use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::{Device, Protocol};
use crate::error::{ErrorKind, LoadError};

/// Hono endpoint a message is published to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Telemetry,
    Event,
}

impl MessageType {
    pub fn endpoint(&self) -> &'static str {
        match self {
            MessageType::Telemetry => "telemetry",
            MessageType::Event => "event",
        }
    }
}

impl FromStr for MessageType {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "telemetry" => Ok(MessageType::Telemetry),
            "event" => Ok(MessageType::Event),
            other => Err(LoadError::Config(format!(
                "unknown message type '{}', expected telemetry or event",
                other
            ))),
        }
    }
}

/// Synthetic sensor reading sent by a device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Telemetry {
    pub device_id: String,
    pub tenant_id: String,
    pub timestamp: i64,
    pub message_count: u64,
    pub protocol: Protocol,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub battery: f64,
    pub signal_strength: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub validation: bool,
}

impl Telemetry {
    pub fn random<R: Rng + ?Sized>(device: &Device, message_count: u64, rng: &mut R) -> Self {
        Self {
            device_id: device.id.clone(),
            tenant_id: device.tenant_id.clone(),
            timestamp: Utc::now().timestamp(),
            message_count,
            protocol: device.protocol,
            temperature: round2(rng.gen_range(18.0..35.0)),
            humidity: round2(rng.gen_range(30.0..90.0)),
            pressure: round2(rng.gen_range(980.0..1030.0)),
            battery: round2(rng.gen_range(20.0..100.0)),
            signal_strength: rng.gen_range(-100..=-30),
            validation: false,
        }
    }

    /// Fixed reading used for the pre-flight round trip.
    pub fn validation(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            tenant_id: device.tenant_id.clone(),
            timestamp: Utc::now().timestamp(),
            message_count: 0,
            protocol: device.protocol,
            temperature: 25.0,
            humidity: 60.0,
            pressure: 1013.0,
            battery: 100.0,
            signal_strength: -50,
            validation: true,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoadError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl FromStr for Telemetry {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Result of one send attempt, handed to the aggregator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MessageOutcome {
    pub device_id: String,
    pub protocol: Protocol,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency: Option<Duration>,
    pub error_kind: Option<ErrorKind>,
}

impl MessageOutcome {
    pub fn success(device: &Device, latency: Duration) -> Self {
        Self {
            device_id: device.id.clone(),
            protocol: device.protocol,
            timestamp: Utc::now(),
            success: true,
            latency: Some(latency),
            error_kind: None,
        }
    }

    pub fn failure(device: &Device, kind: ErrorKind) -> Self {
        Self {
            device_id: device.id.clone(),
            protocol: device.protocol,
            timestamp: Utc::now(),
            success: false,
            latency: None,
            error_kind: Some(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn telemetry_round_trips_through_json() {
        let device = Device::new("device-7", "tenant-a", "pw").assign(Protocol::Http);
        let mut rng = StdRng::seed_from_u64(7);
        let reading = Telemetry::random(&device, 3, &mut rng);

        let text = String::from_utf8(reading.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("validation"));
        assert_eq!(text.parse::<Telemetry>().unwrap(), reading);
        assert!((18.0..35.0).contains(&reading.temperature));
        assert!((-100..=-30).contains(&reading.signal_strength));
    }
}
