//! Error types for the Bluetooth module

use thiserror::Error;

use crate::core::bluetooth::types::ConnectionState;
use crate::core::packet::FrameError;

/// Failures reported by the radio transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No Bluetooth adapter found")]
    AdapterUnavailable,

    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Unknown link: {0}")]
    UnknownLink(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Capability failures are terminal for the current operation
    pub fn is_capability_denied(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable | Self::AdapterDisabled | Self::PermissionDenied(_)
        )
    }
}

/// Why a connect request was refused or failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connection already {0:?}")]
    Busy(ConnectionState),

    #[error("Device not found in roster: {0}")]
    UnknownPeripheral(String),

    #[error("Connection cancelled before it completed")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a frame was not handed to the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("No device connected")]
    NotConnected,

    #[error("No writable characteristic found")]
    NoWritableCharacteristic,

    #[error("Failed to write frame: {0}")]
    WriteFailed(String),
}

/// Dispatcher failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("Frame failed self-check: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Send(#[from] SendError),
}
