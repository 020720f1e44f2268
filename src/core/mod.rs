//! Core functionality for the stimulator controller
//! Frame encoding plus the Bluetooth discovery, connection and command layers

pub mod bluetooth;
pub mod packet;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, CommandDispatcher};
pub use packet::{ChannelMask, Command, CommandFrame, Waveform};
