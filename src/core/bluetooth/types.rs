//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::UNNAMED_DEVICE;

/// Represents a discovered stimulator (one roster row)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralRecord {
    /// Platform-specific identifier, used to re-resolve the row to a connectable device
    pub id: String,
    /// Advertised name, else platform name, else "(Unnamed)"
    pub display_name: String,
    /// Hardware address, `None` when the platform withholds it
    pub address: Option<String>,
    /// Latest signal strength
    pub rssi: Option<i16>,
    /// False when the record is keyed only by its display name
    pub identity_verified: bool,
}

impl PeripheralRecord {
    pub fn identity_key(&self) -> IdentityKey {
        match &self.address {
            Some(address) => IdentityKey::Address(address.clone()),
            None => IdentityKey::Name(self.display_name.clone()),
        }
    }

    /// True if `key` names this record (address, or name for unverified rows, or platform id)
    pub fn matches_key(&self, key: &str) -> bool {
        if self.id == key {
            return true;
        }
        match &self.address {
            Some(address) => address.eq_ignore_ascii_case(key),
            None => self.display_name == key,
        }
    }

    pub fn has_real_name(&self) -> bool {
        self.display_name != UNNAMED_DEVICE
    }
}

/// Roster identity: the address when known, otherwise the display name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Address(String),
    Name(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Address(address) => write!(f, "{}", address),
            IdentityKey::Name(name) => write!(f, "name:{}", name),
        }
    }
}

/// One advertisement as reported by the radio transport
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: String,
    /// Name carried in the advertisement payload
    pub local_name: Option<String>,
    /// Name the platform has cached for the device
    pub device_name: Option<String>,
    pub address: Option<String>,
    pub rssi: Option<i16>,
}

/// Opaque handle for one connection attempt, allocated by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Identifies one scan session so late failures from an earlier one can be told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScanHandle(pub u64);

impl fmt::Display for ScanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan#{}", self.0)
    }
}

/// Link-level state change reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

/// Everything the transport reports asynchronously
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Discovered(Advertisement),
    ScanFailed(ScanHandle, String),
    Link(LinkHandle, LinkEvent),
}

/// Channel the transport pushes its events into. Sending never blocks.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// How a characteristic accepts writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicInfo {
    /// Acknowledged writes are preferred when both modes are supported
    pub fn preferred_write_mode(&self) -> Option<WriteMode> {
        if self.write {
            Some(WriteMode::WithResponse)
        } else if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else {
            None
        }
    }
}

/// The characteristic and mode used for outbound frames on the active link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget {
    pub characteristic: Uuid,
    pub mode: WriteMode,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

/// Why a scan session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStopReason {
    Requested,
    TimedOut,
    Failed,
}

/// Result of toggling the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanToggle {
    Started { deadline: DateTime<Utc> },
    Stopped,
}

/// Events published to the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ManagerEvent {
    ScanStarted { deadline: DateTime<Utc> },
    ScanStopped { reason: ScanStopReason },
    ScanFailed { message: String },
    DeviceFound(PeripheralRecord),
    DeviceUpdated(PeripheralRecord),
    ConnectionStateChanged {
        state: ConnectionState,
        peer_address: Option<String>,
    },
    ServicesResolved { writable: bool },
    DeviceLostConnection { peer_address: Option<String> },
}
