//! Error types for the host engine.
//!
//! Only [`ConfigError`] is ever fatal. Everything else is recovered where it
//! happens and surfaces as a log line, a dropped reading or a failed
//! [`ChannelResult`](crate::dispatch::ChannelResult).

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::classifier::ThresholdError;

/// A reading that was not classified.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("malformed reading: {0}")]
    Malformed(String),

    #[error("confidence {confidence:.2} below minimum {min:.2}")]
    LowConfidence { confidence: f64, min: f64 },
}

/// One channel failed to deliver one event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("channel worker disconnected")]
    Disconnected,
}

/// Serial beacon driver failures.
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("serial device {path} unavailable: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    #[error("write to serial device timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("another beacon message is in flight")]
    Busy,

    #[error("message does not fit one protocol line")]
    Encode,

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<SerialError> for ChannelError {
    fn from(err: SerialError) -> Self {
        match err {
            SerialError::DeviceUnavailable { .. } => ChannelError::Unavailable(err.to_string()),
            SerialError::WriteTimeout(after) => ChannelError::Timeout(after),
            SerialError::Busy | SerialError::Encode | SerialError::Io(_) => {
                ChannelError::Rejected(err.to_string())
            }
        }
    }
}

/// Invalid configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid threshold table: {0}")]
    Thresholds(#[from] ThresholdError),

    #[error("invalid config: {0}")]
    Invalid(String),
}
