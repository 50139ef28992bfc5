use crate::command::Opcode;
use crate::status::Status;
use crate::DeviceType;
use std::array::TryFromSliceError;
use thiserror::Error;

/// The primary error type for the `cryptoauth` library.
#[derive(Error, Debug)]
pub enum AtcaError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device returned status {0}")]
    DeviceStatus(Status),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Opcode {opcode} is not supported by {device_type}")]
    UnsupportedOpcode { opcode: Opcode, device_type: DeviceType },

    #[error("Device handle has been destroyed")]
    Destroyed,

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

/// A frame that arrived intact on the bus but is not a valid packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Count byte says {declared} bytes, got {actual}")]
    CountMismatch { declared: usize, actual: usize },

    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Frame too long: at most {max} bytes allowed, got {actual}")]
    TooLong { max: usize, actual: usize },
}

/// The bus failed to move bytes to or from the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device did not acknowledge")]
    Nack,

    #[error("Timeout during bus operation")]
    Timeout,

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Unexpected wake token {}", hex::encode(.0))]
    WakeFailed([u8; 4]),

    #[error("Bus error: {0}")]
    Bus(String),
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TransportError::Timeout
    }
}

impl From<tokio::time::error::Elapsed> for AtcaError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AtcaError::Transport(TransportError::Timeout)
    }
}

impl From<TryFromSliceError> for AtcaError {
    fn from(_: TryFromSliceError) -> Self {
        AtcaError::BadParameter("Failed to convert slice to array".to_string())
    }
}

impl AtcaError {
    /// The device status carried by this error, if it is a device-level failure.
    pub fn status(&self) -> Option<Status> {
        match self {
            AtcaError::DeviceStatus(status) => Some(*status),
            _ => None,
        }
    }
}
