//! Application state management
//! This module wires the Bluetooth manager, the command dispatcher and the operator log together.

use std::sync::Arc;
use anyhow::Result;
use log::info;
use crate::config::AppConfig;
use crate::core::bluetooth::{
    BluestTransport, BluetoothManager, CommandDispatcher, ConnectionManager, RadioTransport,
};
use crate::logging::OperatorLog;

/// Global application state
pub struct AppState<T: RadioTransport = BluestTransport> {
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<BluetoothManager<T>>,
    /// Sends stimulation commands over the manager's connection
    pub dispatcher: CommandDispatcher<ConnectionManager<T>>,
    pub config: AppConfig,
    pub operator_log: OperatorLog,
}

impl<T: RadioTransport> AppState<T> {
    /// Builds the state around an already opened transport. Must be called inside a Tokio runtime.
    pub fn with_transport(transport: T, config: AppConfig, operator_log: OperatorLog) -> Self {
        let manager = BluetoothManager::new(transport, config.scan.clone());
        let dispatcher = CommandDispatcher::new(manager.connection().clone())
            .with_current_limit(config.stim.current_limit_ma);
        Self {
            bluetooth_manager: Arc::new(manager),
            dispatcher,
            config,
            operator_log,
        }
    }
}

impl AppState<BluestTransport> {
    /// Creates a new AppState on the system Bluetooth adapter
    pub async fn new(config: AppConfig, operator_log: OperatorLog) -> Result<Self> {
        info!("Initializing BluetoothManager...");
        let transport = BluestTransport::new().await?;
        Ok(Self::with_transport(transport, config, operator_log))
    }
}
