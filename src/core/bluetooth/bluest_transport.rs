//! Radio transport backed by the bluest library
//! Scans, connects and writes using the platform Bluetooth stack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::{ADAPTER_READY_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS};
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::RadioTransport;
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicInfo, EventSink, LinkEvent, LinkHandle, ScanHandle,
    TransportEvent, WriteMode,
};

struct ActiveLink {
    device: Device,
    characteristics: Vec<Characteristic>,
    monitor: JoinHandle<()>,
}

struct ScanTask {
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct BluestTransport {
    adapter: Adapter,
    /// Devices seen while scanning, keyed by platform id
    devices: Arc<Mutex<HashMap<String, Device>>>,
    links: Mutex<HashMap<LinkHandle, ActiveLink>>,
    scan: tokio::sync::Mutex<ScanTask>,
}

impl BluestTransport {
    /// Opens the default adapter
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        info!("Bluetooth adapter found.");

        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            links: Mutex::new(HashMap::new()),
            scan: tokio::sync::Mutex::new(ScanTask {
                cancel_token: CancellationToken::new(),
                handle: None,
            }),
        })
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        scan: ScanHandle,
        sink: EventSink,
        cancel_token: CancellationToken,
    ) {
        info!("Starting bluetooth scan ({})", scan);
        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start bluetooth scan: {}", e);
                let _ = sink.send(TransportEvent::ScanFailed(scan, e.to_string()));
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            let device = discovered_device.device;
                            let id = device.id().to_string();
                            let advertisement = Advertisement {
                                id: id.clone(),
                                local_name: discovered_device.adv_data.local_name.clone(),
                                device_name: device.name().ok(),
                                address: extract_mac_address(&id),
                                rssi: discovered_device.rssi,
                            };
                            debug!("Found device - {:?}", advertisement);

                            devices
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(id, device);
                            if sink.send(TransportEvent::Discovered(advertisement)).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    fn link_device(&self, link: LinkHandle) -> Result<Device, TransportError> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&link)
            .map(|active| active.device.clone())
            .ok_or_else(|| TransportError::UnknownLink(link.to_string()))
    }
}

#[async_trait]
impl RadioTransport for BluestTransport {
    async fn check_available(&self) -> Result<(), TransportError> {
        let wait = Duration::from_secs(ADAPTER_READY_TIMEOUT_SECS);
        match tokio::time::timeout(wait, self.adapter.wait_available()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(map_bluest_error(e)),
            Err(_) => Err(TransportError::AdapterDisabled),
        }
    }

    async fn start_scan(&self, scan_id: ScanHandle, sink: EventSink) -> Result<(), TransportError> {
        let mut scan = self.scan.lock().await;
        if let Some(previous) = scan.handle.take() {
            scan.cancel_token.cancel();
            let _ = previous.await;
        }

        // Connected links hold their own device clone
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        scan.cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.devices.clone(),
            scan_id,
            sink,
            scan.cancel_token.clone(),
        ));
        scan.handle = Some(handle);
        info!("Device scan task started.");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut scan = self.scan.lock().await;
        scan.cancel_token.cancel();

        if let Some(handle) = scan.handle.take() {
            info!("Waiting for scan task to finish...");
            match handle.await {
                Ok(()) => info!("Scan task finished after cancellation."),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
                Err(e) => {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                    return Err(TransportError::Other(e.to_string()));
                }
            }
        } else {
            info!("No active scan task handle found to wait for.");
        }
        Ok(())
    }

    async fn connect(
        &self,
        peripheral_id: &str,
        link: LinkHandle,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(peripheral_id.to_string()))?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", peripheral_id);
            let wait = Duration::from_secs(CONNECT_TIMEOUT_SECS);
            tokio::time::timeout(wait, self.adapter.connect_device(&device))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(map_bluest_error)?;
        }

        let adapter = self.adapter.clone();
        let monitored = device.clone();
        let monitor_sink = sink.clone();
        let monitor = tokio::spawn(async move {
            match adapter.device_connection_events(&monitored).await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if matches!(event, ConnectionEvent::Disconnected) {
                            let _ = monitor_sink
                                .send(TransportEvent::Link(link, LinkEvent::Disconnected));
                            break;
                        }
                    }
                }
                Err(e) => warn!("Cannot watch connection events for {}: {}", link, e),
            }
        });

        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                link,
                ActiveLink {
                    device,
                    characteristics: Vec::new(),
                    monitor,
                },
            );
        let _ = sink.send(TransportEvent::Link(link, LinkEvent::Connected));
        Ok(())
    }

    async fn discover_services(
        &self,
        link: LinkHandle,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let device = self.link_device(link)?;
        let services = device.services().await.map_err(map_bluest_error)?;

        let mut found = Vec::new();
        let mut infos = Vec::new();
        for service in services {
            debug!("Available service: {}", service.uuid());
            for characteristic in service.characteristics().await.map_err(map_bluest_error)? {
                let properties = characteristic
                    .properties()
                    .await
                    .map_err(map_bluest_error)?;
                infos.push(CharacteristicInfo {
                    uuid: characteristic.uuid(),
                    write: properties.write,
                    write_without_response: properties.write_without_response,
                });
                found.push(characteristic);
            }
        }

        if let Some(active) = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&link)
        {
            active.characteristics = found;
        }
        Ok(infos)
    }

    async fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError> {
        let active = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&link)
            .ok_or_else(|| TransportError::UnknownLink(link.to_string()))?;
        active.monitor.abort();

        if active.device.is_connected().await {
            info!("Disconnecting from device {}", active.device.id());
            self.adapter
                .disconnect_device(&active.device)
                .await
                .map_err(map_bluest_error)?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", active.device.id());
        }
        Ok(())
    }

    async fn write(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let target = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&link)
            .ok_or_else(|| TransportError::UnknownLink(link.to_string()))?
            .characteristics
            .iter()
            .find(|c| c.uuid() == characteristic)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("Characteristic not found: {}", characteristic)))?;

        match mode {
            WriteMode::WithResponse => target.write(data).await,
            WriteMode::WithoutResponse => target.write_without_response(data).await,
        }
        .map_err(map_bluest_error)
    }
}

fn map_bluest_error(e: bluest::Error) -> TransportError {
    match e.kind() {
        ErrorKind::NotAuthorized => TransportError::PermissionDenied(e.to_string()),
        ErrorKind::AdapterUnavailable => TransportError::AdapterDisabled,
        ErrorKind::Timeout => TransportError::Timeout,
        _ => TransportError::Other(e.to_string()),
    }
}

/// Pulls a MAC address out of a platform device id, if the platform embeds one
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_is_extracted_from_platform_ids() {
        assert_eq!(
            extract_mac_address("BluetoothLE#BluetoothLEe0:d4:64:11:22:33-a1-b2-c3-d4-e5-f6").as_deref(),
            Some("A1:B2:C3:D4:E5:F6")
        );
        assert_eq!(
            extract_mac_address("/org/bluez/hci0/dev_AA_BB").as_deref(),
            None
        );
        assert_eq!(
            extract_mac_address("12:34:56:78:9a:bc").as_deref(),
            Some("12:34:56:78:9A:BC")
        );
    }
}
