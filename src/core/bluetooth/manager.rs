//! Bluetooth manager for the stimulator controller
//! This module provides the main interface for discovery and connection handling

use std::sync::{Arc, Mutex, PoisonError};

use log::info;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::scan_config::ScanConfig;
use crate::core::bluetooth::connection::ConnectionManager;
use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::error::{ConnectError, TransportError};
use crate::core::bluetooth::roster::Roster;
use crate::core::bluetooth::scanner::{BluetoothScanner, ScanStatus};
use crate::core::bluetooth::transport::RadioTransport;
use crate::core::bluetooth::types::{
    ConnectionState, LinkHandle, ManagerEvent, PeripheralRecord, ScanToggle, TransportEvent,
};

/// Manages discovery and the single stimulator connection.
/// Transport events are funnelled through one pump task, which is the only
/// writer of the roster and of link state driven by the radio.
pub struct BluetoothManager<T: RadioTransport> {
    /// Discovered devices for the current scan window
    roster: Arc<Mutex<Roster>>,
    /// Bluetooth scanner
    scanner: BluetoothScanner<T>,
    /// Connection manager
    connection: ConnectionManager<T>,
    events: broadcast::Sender<ManagerEvent>,
    pump: JoinHandle<()>,
}

impl<T: RadioTransport> BluetoothManager<T> {
    /// Creates a new BluetoothManager. Must be called inside a Tokio runtime.
    pub fn new(transport: T, config: ScanConfig) -> Self {
        let transport = Arc::new(transport);
        let (sink, transport_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let roster = Arc::new(Mutex::new(Roster::new()));

        let preferred_characteristic = config.write_characteristic;
        let scanner = BluetoothScanner::new(
            transport.clone(),
            roster.clone(),
            config,
            events.clone(),
            sink.clone(),
        );
        let connection =
            ConnectionManager::new(transport, events.clone(), sink, preferred_characteristic);

        let pump = tokio::spawn(Self::pump_events(
            transport_rx,
            scanner.clone(),
            connection.clone(),
        ));

        Self {
            roster,
            scanner,
            connection,
            events,
            pump,
        }
    }

    async fn pump_events(
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        scanner: BluetoothScanner<T>,
        connection: ConnectionManager<T>,
    ) {
        while let Some(event) = transport_rx.recv().await {
            match event {
                TransportEvent::Discovered(advertisement) => {
                    scanner.handle_advertisement(advertisement).await
                }
                TransportEvent::ScanFailed(scan, message) => {
                    scanner.fail_session(scan, message).await
                }
                TransportEvent::Link(link, event) => connection.handle_link_event(link, event),
            }
        }
        info!("Transport event stream has ended.");
    }

    /// Starts scanning when idle, stops otherwise
    pub async fn toggle_scan(&self) -> Result<ScanToggle, TransportError> {
        self.scanner.toggle().await
    }

    pub async fn stop_scan(&self) -> bool {
        self.scanner.stop_scan().await
    }

    pub async fn scan_status(&self) -> ScanStatus {
        self.scanner.status().await
    }

    /// Snapshot of the roster in discovery order
    pub fn roster(&self) -> Vec<PeripheralRecord> {
        self.roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Looks up a roster entry by address, platform id, or name of an unverified row
    pub fn find_device(&self, key: &str) -> Option<PeripheralRecord> {
        self.roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .find(key)
            .cloned()
    }

    /// Connects to the roster entry named by `key`
    pub async fn connect_device(&self, key: &str) -> Result<LinkHandle, ConnectError> {
        let record = self
            .find_device(key)
            .ok_or_else(|| ConnectError::UnknownPeripheral(key.to_string()))?;

        self.connection.connect(&record).await
    }

    /// Disconnects from the currently connected device
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.connection.disconnect().await
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }
}

impl<T: RadioTransport> Drop for BluetoothManager<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
