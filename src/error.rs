use std::io;
use thiserror::Error;

use crate::sensor::SensorType;

/// The primary error type for the `libre2-rs` library.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("packet checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("unsupported sensor type: {0}")]
    UnsupportedSensor(SensorType),

    #[error("sensor not paired: {missing} missing")]
    NotPaired { missing: &'static str },

    #[error("characteristic {0} not found on peripheral")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("manager is shut down")]
    ManagerGone,

    #[cfg(feature = "btleplug")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}
