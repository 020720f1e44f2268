//! Operator commands
//! This module defines the calls the front end makes into the controller.
//! Errors are flattened to strings at this boundary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::core::bluetooth::{
    ManagerEvent, PeripheralRecord, RadioTransport, ScanToggle, StimParams,
};
use crate::core::packet::{ChannelMask, CommandFrame, Waveform};
use crate::logging::LogMessage;
use crate::state::AppState;
use crate::utils::to_hex;

/// One stimulation command as requested by the operator
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum StimRequest {
    SetFrequency {
        channels: Vec<u8>,
        frequency_hz: u32,
    },
    Configure {
        channels: Vec<u8>,
        phase: u32,
        current_ma: f32,
        #[serde(default)]
        frequency_hz: u32,
        #[serde(default)]
        waveform: Waveform,
    },
    SetOnCounter {
        channels: Vec<u8>,
        ticks: u32,
    },
    SetOffCounter {
        channels: Vec<u8>,
        ticks: u32,
    },
    Enable {
        channels: Vec<u8>,
    },
    Disable {
        channels: Vec<u8>,
    },
}

/// Starts a scan window. Returns when the window will close on its own.
pub async fn start_scan<T: RadioTransport>(app_state: &AppState<T>) -> Result<DateTime<Utc>, String> {
    let manager = &app_state.bluetooth_manager;
    let status = manager.scan_status().await;
    if let (true, Some(deadline)) = (status.active, status.deadline) {
        info!("Scan already running until {}.", deadline);
        return Ok(deadline);
    }

    match manager.toggle_scan().await.map_err(|e| e.to_string())? {
        ScanToggle::Started { deadline } => Ok(deadline),
        ScanToggle::Stopped => Err("Scan stopped instead of starting".to_string()),
    }
}

/// Stops the running scan. Returns false if nothing was running.
pub async fn stop_scan<T: RadioTransport>(app_state: &AppState<T>) -> Result<bool, String> {
    Ok(app_state.bluetooth_manager.stop_scan().await)
}

/// Runs one full scan window and returns everything that was found
pub async fn scan_devices<T: RadioTransport>(
    app_state: &AppState<T>,
) -> Result<Vec<PeripheralRecord>, String> {
    let manager = &app_state.bluetooth_manager;
    let mut events = manager.subscribe_events();
    start_scan(app_state).await?;

    loop {
        match events.recv().await {
            Ok(ManagerEvent::ScanStopped { reason }) => {
                info!("Scan finished ({:?}).", reason);
                break;
            }
            Ok(ManagerEvent::ScanFailed { message }) => {
                return Err(format!("Scan failed: {}", message));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} scan events.", skipped);
                if !manager.scan_status().await.active {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(manager.roster())
}

/// Scans until the device named by `key` shows up, then stops scanning
pub async fn discover_device<T: RadioTransport>(
    app_state: &AppState<T>,
    key: &str,
) -> Result<PeripheralRecord, String> {
    let manager = &app_state.bluetooth_manager;
    let mut events = manager.subscribe_events();
    start_scan(app_state).await?;

    let found = loop {
        match events.recv().await {
            Ok(ManagerEvent::DeviceFound(record) | ManagerEvent::DeviceUpdated(record))
                if record.matches_key(key) =>
            {
                break Some(record);
            }
            Ok(ManagerEvent::ScanStopped { .. }) => break manager.find_device(key),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if let Some(record) = manager.find_device(key) {
                    break Some(record);
                }
                if !manager.scan_status().await.active {
                    break None;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break None,
        }
    };

    manager.stop_scan().await;
    found.ok_or_else(|| format!("Device not found: {}", key))
}

/// Connects to a discovered device and waits until commands can be written to it
pub async fn connect_to_device<T: RadioTransport>(
    app_state: &AppState<T>,
    key: &str,
    timeout: Duration,
) -> Result<(), String> {
    let manager = &app_state.bluetooth_manager;
    manager.connect_device(key).await.map_err(|e| e.to_string())?;

    if manager.connection().wait_until_writable(timeout).await {
        info!("Device {} is ready for commands.", key);
        Ok(())
    } else {
        let state = manager.connection_state();
        Err(format!("Device {} not ready for commands (state {:?})", key, state))
    }
}

/// Disconnects from the currently connected device
pub async fn disconnect<T: RadioTransport>(app_state: &AppState<T>) -> Result<(), String> {
    app_state
        .bluetooth_manager
        .disconnect()
        .await
        .map_err(|e| e.to_string())
}

pub fn list_devices<T: RadioTransport>(app_state: &AppState<T>) -> Vec<PeripheralRecord> {
    app_state.bluetooth_manager.roster()
}

/// Sends one command and returns the frame that went out, as hex
pub async fn send_command<T: RadioTransport>(
    app_state: &AppState<T>,
    request: StimRequest,
) -> Result<String, String> {
    let dispatcher = &app_state.dispatcher;
    let frame = match request {
        StimRequest::SetFrequency {
            channels,
            frequency_hz,
        } => dispatcher.set_frequency(mask(&channels)?, frequency_hz).await,
        StimRequest::Configure {
            channels,
            phase,
            current_ma,
            frequency_hz,
            waveform,
        } => {
            let params = StimParams {
                phase,
                current_ma,
                frequency_hz,
                waveform,
            };
            dispatcher.configure(mask(&channels)?, params).await
        }
        StimRequest::SetOnCounter { channels, ticks } => {
            dispatcher.set_on_counter(mask(&channels)?, ticks).await
        }
        StimRequest::SetOffCounter { channels, ticks } => {
            dispatcher.set_off_counter(mask(&channels)?, ticks).await
        }
        StimRequest::Enable { channels } => dispatcher.enable(mask(&channels)?).await,
        StimRequest::Disable { channels } => dispatcher.disable(mask(&channels)?).await,
    }
    .map_err(|e| e.to_string())?;

    Ok(hex(&frame))
}

/// Sends the configured operator defaults: frequency, configure and any counters set
pub async fn apply_defaults<T: RadioTransport>(app_state: &AppState<T>) -> Result<Vec<String>, String> {
    let stim = &app_state.config.stim;
    let dispatcher = &app_state.dispatcher;
    let channels = stim.channel_mask().map_err(|e| e.to_string())?;

    let mut sent = vec![
        dispatcher
            .set_frequency(channels, stim.frequency_hz)
            .await
            .map_err(|e| e.to_string())?,
        dispatcher
            .configure(channels, stim.params())
            .await
            .map_err(|e| e.to_string())?,
    ];
    if let Some(ticks) = stim.on_counter {
        sent.push(
            dispatcher
                .set_on_counter(channels, ticks)
                .await
                .map_err(|e| e.to_string())?,
        );
    }
    if let Some(ticks) = stim.off_counter {
        sent.push(
            dispatcher
                .set_off_counter(channels, ticks)
                .await
                .map_err(|e| e.to_string())?,
        );
    }
    Ok(sent.iter().map(hex).collect())
}

/// Recent log lines, newest first
pub fn operator_log<T: RadioTransport>(app_state: &AppState<T>) -> Vec<LogMessage> {
    app_state.operator_log.snapshot()
}

fn mask(channels: &[u8]) -> Result<ChannelMask, String> {
    ChannelMask::from_channels(channels).map_err(|e| e.to_string())
}

fn hex(frame: &CommandFrame) -> String {
    to_hex(&frame.to_bytes())
}
