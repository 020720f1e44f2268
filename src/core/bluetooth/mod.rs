//! Bluetooth functionality for the stimulator controller
//! This module handles scanning, the device roster, the single connection
//! and writing command frames to the stimulator.

pub mod bluest_transport;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod error;
pub mod manager;
pub mod roster;
pub mod scanner;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use commands::{CommandDispatcher, FrameSender, StimParams};
pub use connection::ConnectionManager;
pub use error::{ConnectError, DispatchError, SendError, TransportError};
pub use manager::BluetoothManager;
pub use scanner::{BluetoothScanner, ScanStatus};
pub use transport::RadioTransport;
pub use types::{
    Advertisement, CharacteristicInfo, ConnectionState, EventSink, LinkEvent, LinkHandle,
    ManagerEvent, PeripheralRecord, ScanHandle, ScanStopReason, ScanToggle, TransportEvent,
    WriteMode,
};
