use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Protocol;

/// Classification of a failed attempt, as tallied in statistics.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Unauthorized,
    Rejected,
    Transport,
    Connect,
    InvalidCredential,
    ProtocolUnsupported,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Transport => "transport",
            ErrorKind::Connect => "connect",
            ErrorKind::InvalidCredential => "invalid_credential",
            ErrorKind::ProtocolUnsupported => "protocol_unsupported",
        }
    }

    /// Whether a sender reporting this kind can never succeed for the device.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::InvalidCredential | ErrorKind::ProtocolUnsupported)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    /// The registry could not provide the devices a run needs.
    #[error("provisioning failed: {message}")]
    Provisioning { message: String },

    /// A device failed its pre-flight round trip.
    #[error("device `{device_id}` failed validation: {reason}")]
    Validation { device_id: String, reason: String },

    /// A single delivery attempt failed.
    #[error("send failed ({kind}): {message}")]
    Send { kind: ErrorKind, message: String },

    #[error("protocol `{0}` is not supported")]
    ProtocolUnsupported(Protocol),

    #[error("device `{0}` has a malformed identity or credential")]
    InvalidCredential(String),

    /// A worker ignored cancellation for longer than the grace period.
    #[error("device `{0}` did not stop within the shutdown grace period")]
    ForcedCancellation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metrics server error: {0}")]
    Server(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoadError {
    pub fn send(kind: ErrorKind, message: impl fmt::Display) -> Self {
        LoadError::Send {
            kind,
            message: message.to_string(),
        }
    }

    pub fn provisioning(message: impl fmt::Display) -> Self {
        LoadError::Provisioning {
            message: message.to_string(),
        }
    }

    /// Maps the error onto the kind recorded in a failed outcome.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::Send { kind, .. } => *kind,
            LoadError::ProtocolUnsupported(_) => ErrorKind::ProtocolUnsupported,
            LoadError::InvalidCredential(_) => ErrorKind::InvalidCredential,
            LoadError::Provisioning { .. }
            | LoadError::Validation { .. }
            | LoadError::Config(_)
            | LoadError::Server(_) => ErrorKind::Connect,
            LoadError::ForcedCancellation(_) | LoadError::Io(_) | LoadError::Json(_) => {
                ErrorKind::Transport
            }
        }
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ErrorKind::Timeout
        } else if e.is_connect() {
            ErrorKind::Connect
        } else {
            ErrorKind::Transport
        };

        LoadError::send(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
