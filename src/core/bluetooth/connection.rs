//! Bluetooth connection handling for the stimulator
//! This module tracks the single active link and writes command frames to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::core::bluetooth::error::{ConnectError, SendError, TransportError};
use crate::core::bluetooth::transport::RadioTransport;
use crate::core::bluetooth::types::{
    CharacteristicInfo, ConnectionState, EventSink, LinkEvent, LinkHandle, ManagerEvent,
    PeripheralRecord, WriteTarget,
};
use crate::core::packet::CommandFrame;
use crate::utils::to_hex;

#[derive(Debug, Default)]
struct LinkSlot {
    state: ConnectionState,
    peer_address: Option<String>,
    link: Option<LinkHandle>,
    writer: Option<WriteTarget>,
}

/// Connection manager for the stimulator
pub struct ConnectionManager<T: RadioTransport> {
    transport: Arc<T>,
    slot: Arc<Mutex<LinkSlot>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ManagerEvent>,
    sink: EventSink,
    next_link: Arc<AtomicU64>,
    preferred_characteristic: Option<Uuid>,
}

impl<T: RadioTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            slot: self.slot.clone(),
            state_tx: self.state_tx.clone(),
            events: self.events.clone(),
            sink: self.sink.clone(),
            next_link: self.next_link.clone(),
            preferred_characteristic: self.preferred_characteristic,
        }
    }
}

impl<T: RadioTransport> ConnectionManager<T> {
    pub fn new(
        transport: Arc<T>,
        events: broadcast::Sender<ManagerEvent>,
        sink: EventSink,
        preferred_characteristic: Option<Uuid>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            slot: Arc::new(Mutex::new(LinkSlot::default())),
            state_tx: Arc::new(state_tx),
            events,
            sink,
            next_link: Arc::new(AtomicU64::new(0)),
            preferred_characteristic,
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_slot().state
    }

    pub fn peer_address(&self) -> Option<String> {
        self.lock_slot().peer_address.clone()
    }

    /// True once service discovery found a characteristic frames can be written to
    pub fn is_writable(&self) -> bool {
        let slot = self.lock_slot();
        slot.state == ConnectionState::Ready && slot.writer.is_some()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Waits until the connection reaches `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    /// Waits until the link is ready and a writable characteristic is known.
    /// Returns false on timeout or if the link drops first.
    pub async fn wait_until_writable(&self, timeout: Duration) -> bool {
        let mut events = self.events.subscribe();
        if self.is_writable() {
            return true;
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ManagerEvent::ServicesResolved { writable }) => return writable,
                    Ok(ManagerEvent::ConnectionStateChanged {
                        state: ConnectionState::Disconnected,
                        ..
                    }) => return false,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_writable() {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Starts connecting to `record`. Only valid while disconnected;
    /// completion is reported through the transport's link events.
    pub async fn connect(&self, record: &PeripheralRecord) -> Result<LinkHandle, ConnectError> {
        let peer_address = record
            .address
            .clone()
            .unwrap_or_else(|| record.display_name.clone());

        let link = {
            let mut slot = self.lock_slot();
            if slot.state != ConnectionState::Disconnected {
                warn!("Refusing to connect to {}: connection is {:?}", peer_address, slot.state);
                return Err(ConnectError::Busy(slot.state));
            }
            let link = LinkHandle(self.next_link.fetch_add(1, Ordering::Relaxed) + 1);
            slot.link = Some(link);
            slot.writer = None;
            slot.peer_address = Some(peer_address.clone());
            self.transition(&mut slot, ConnectionState::Connecting);
            link
        };

        if !record.identity_verified {
            warn!(
                "Connecting to {:?} matched by name only; its identity is unverified.",
                record.display_name
            );
        }

        info!("Initiating connection to {} ({})...", peer_address, link);
        if let Err(e) = self.transport.connect(&record.id, link, self.sink.clone()).await {
            error!("Connection to {} failed: {}", peer_address, e);
            let mut slot = self.lock_slot();
            if slot.link == Some(link) {
                self.reset(&mut slot);
            }
            return Err(e.into());
        }

        let superseded = {
            let slot = self.lock_slot();
            slot.link != Some(link) || slot.state == ConnectionState::Closing
        };
        if superseded {
            info!("Connection {} was cancelled while connecting, releasing it.", link);
            self.release_link(link).await;
            return Err(ConnectError::Cancelled);
        }
        Ok(link)
    }

    /// Applies a link event from the transport. Events for links other than the current one are ignored.
    pub fn handle_link_event(&self, link: LinkHandle, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                {
                    let mut slot = self.lock_slot();
                    if slot.link != Some(link) || slot.state != ConnectionState::Connecting {
                        debug!("Ignoring connected event for {} in state {:?}", link, slot.state);
                        return;
                    }
                    self.transition(&mut slot, ConnectionState::Ready);
                }
                self.spawn_service_discovery(link);
            }
            LinkEvent::Disconnected => {
                let mut slot = self.lock_slot();
                if slot.link != Some(link) {
                    debug!("Ignoring disconnected event for stale {}", link);
                    return;
                }
                let was_ready = slot.state == ConnectionState::Ready;
                let peer_address = slot.peer_address.clone();
                self.reset(&mut slot);
                drop(slot);
                if was_ready {
                    warn!("Device {:?} lost connection.", peer_address);
                    let _ = self
                        .events
                        .send(ManagerEvent::DeviceLostConnection { peer_address });
                }
                self.spawn_release(link);
            }
        }
    }

    fn spawn_release(&self, link: LinkHandle) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.release_link(link).await;
        });
    }

    /// Tells the transport to forget a link the manager no longer tracks
    async fn release_link(&self, link: LinkHandle) {
        match self.transport.disconnect(link).await {
            Ok(()) => debug!("Released {}", link),
            Err(TransportError::UnknownLink(_)) => debug!("{} already released", link),
            Err(e) => warn!("Failed to release {}: {}", link, e),
        }
    }

    fn spawn_service_discovery(&self, link: LinkHandle) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.resolve_write_target(link).await;
        });
    }

    async fn resolve_write_target(&self, link: LinkHandle) -> Option<WriteTarget> {
        info!("Connection successful, discovering services...");
        let target = match self.transport.discover_services(link).await {
            Ok(characteristics) => {
                select_write_target(&characteristics, self.preferred_characteristic)
            }
            Err(e) => {
                error!("Service discovery failed: {}", e);
                None
            }
        };

        let mut slot = self.lock_slot();
        if slot.link != Some(link) || slot.state != ConnectionState::Ready {
            debug!("Discarding service discovery result for stale {}", link);
            return None;
        }
        slot.writer = target;
        match target {
            Some(target) => info!(
                "Using characteristic {} ({:?}) for commands.",
                target.characteristic, target.mode
            ),
            None => warn!("No writable characteristic found on {:?}.", slot.peer_address),
        }
        let _ = self.events.send(ManagerEvent::ServicesResolved {
            writable: target.is_some(),
        });
        target
    }

    /// Writes a frame to the active link. Never reaches the transport unless the link is ready.
    pub async fn send(&self, frame: &CommandFrame) -> Result<(), SendError> {
        let (link, target) = {
            let slot = self.lock_slot();
            if slot.state != ConnectionState::Ready {
                return Err(SendError::NotConnected);
            }
            let link = slot.link.ok_or(SendError::NotConnected)?;
            let target = slot.writer.ok_or(SendError::NoWritableCharacteristic)?;
            (link, target)
        };

        let bytes = frame.to_bytes();
        debug!("Writing [{}] to {} ({:?})", to_hex(&bytes), target.characteristic, target.mode);
        self.transport
            .write(link, target.characteristic, &bytes, target.mode)
            .await
            .map_err(|e| {
                error!("Write to {} failed: {}", link, e);
                SendError::WriteFailed(e.to_string())
            })
    }

    /// Closes the active link. A no-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let (link, was_connecting) = {
            let mut slot = self.lock_slot();
            match (slot.state, slot.link) {
                (state @ (ConnectionState::Connecting | ConnectionState::Ready), Some(link)) => {
                    self.transition(&mut slot, ConnectionState::Closing);
                    (link, state == ConnectionState::Connecting)
                }
                (ConnectionState::Disconnected | ConnectionState::Closing, _) => {
                    info!("No device connected.");
                    return Ok(());
                }
                (_, None) => {
                    self.reset(&mut slot);
                    return Ok(());
                }
            }
        };

        info!("Disconnecting {}", link);
        let result = match self.transport.disconnect(link).await {
            // The pending connect releases the link once the transport knows it
            Err(TransportError::UnknownLink(_)) if was_connecting => Ok(()),
            Err(e) => {
                error!("Failed to disconnect {}: {}", link, e);
                Err(e)
            }
            Ok(()) => Ok(()),
        };

        let mut slot = self.lock_slot();
        if slot.link == Some(link) {
            self.reset(&mut slot);
        }
        result
    }

    fn transition(&self, slot: &mut LinkSlot, state: ConnectionState) {
        if slot.state == state {
            return;
        }
        debug!("Connection state {:?} -> {:?}", slot.state, state);
        slot.state = state;
        self.state_tx.send_replace(state);
        let _ = self.events.send(ManagerEvent::ConnectionStateChanged {
            state,
            peer_address: slot.peer_address.clone(),
        });
    }

    fn reset(&self, slot: &mut LinkSlot) {
        slot.link = None;
        slot.writer = None;
        self.transition(slot, ConnectionState::Disconnected);
        slot.peer_address = None;
    }
}

/// Picks the characteristic for outbound frames: the preferred UUID when it is writable,
/// otherwise the first writable characteristic.
pub fn select_write_target(
    characteristics: &[CharacteristicInfo],
    preferred: Option<Uuid>,
) -> Option<WriteTarget> {
    let to_target = |c: &CharacteristicInfo| {
        c.preferred_write_mode().map(|mode| WriteTarget {
            characteristic: c.uuid,
            mode,
        })
    };

    if let Some(uuid) = preferred {
        if let Some(target) = characteristics
            .iter()
            .filter(|c| c.uuid == uuid)
            .find_map(to_target)
        {
            return Some(target);
        }
        warn!("Configured write characteristic {} not found, falling back.", uuid);
    }
    characteristics.iter().find_map(to_target)
}
