//! Constants used throughout the Bluetooth module
//! Timeouts, sentinels and defaults for discovery and connection handling.

/// Display name used when neither the advertisement nor the platform supplies one
pub const UNNAMED_DEVICE: &str = "(Unnamed)";

/// Address strings some platforms report instead of a real address
pub const ADDRESS_SENTINELS: &[&str] = &["N/A", "00:00:00:00:00:00"];

/// Prefix of the placeholder used when the address is withheld for lack of permission
pub const NO_ADDRESS_PREFIX: &str = "NoAddr";

/// Scan duration in seconds before the session stops itself
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

/// Timeout for establishing a link in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// How long to wait for the adapter to become available in seconds
pub const ADAPTER_READY_TIMEOUT_SECS: u64 = 3;

/// Capacity of the manager event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
