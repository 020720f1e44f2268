//! Scan session handling
//! Toggles discovery on and off, stops it after a fixed window and feeds sightings into the roster.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::scan_config::ScanConfig;
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::roster::{Roster, Upsert, resolve_display_name};
use crate::core::bluetooth::transport::RadioTransport;
use crate::core::bluetooth::types::{
    Advertisement, EventSink, ManagerEvent, ScanHandle, ScanStopReason, ScanToggle,
};

#[derive(Debug)]
struct ScanSession {
    active: bool,
    /// Bumped on every start so a stale auto-stop timer can recognise itself
    generation: u64,
    deadline: Option<DateTime<Utc>>,
    cancel_token: CancellationToken,
}

/// Read-only view of the current scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ScanStatus {
    pub active: bool,
    pub deadline: Option<DateTime<Utc>>,
}

pub struct BluetoothScanner<T: RadioTransport> {
    transport: Arc<T>,
    roster: Arc<Mutex<Roster>>,
    session: Arc<tokio::sync::Mutex<ScanSession>>,
    config: Arc<ScanConfig>,
    events: broadcast::Sender<ManagerEvent>,
    sink: EventSink,
}

impl<T: RadioTransport> Clone for BluetoothScanner<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            roster: self.roster.clone(),
            session: self.session.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<T: RadioTransport> BluetoothScanner<T> {
    pub fn new(
        transport: Arc<T>,
        roster: Arc<Mutex<Roster>>,
        config: ScanConfig,
        events: broadcast::Sender<ManagerEvent>,
        sink: EventSink,
    ) -> Self {
        Self {
            transport,
            roster,
            session: Arc::new(tokio::sync::Mutex::new(ScanSession {
                active: false,
                generation: 0,
                deadline: None,
                cancel_token: CancellationToken::new(),
            })),
            config: Arc::new(config),
            events,
            sink,
        }
    }

    /// Starts a scan when idle, stops the running one otherwise
    pub async fn toggle(&self) -> Result<ScanToggle, TransportError> {
        let mut session = self.session.lock().await;
        if session.active {
            self.stop_locked(&mut session, ScanStopReason::Requested).await;
            Ok(ScanToggle::Stopped)
        } else {
            let deadline = self.start_locked(&mut session).await?;
            Ok(ScanToggle::Started { deadline })
        }
    }

    /// Stops the running scan. Returns false if there was nothing to stop.
    pub async fn stop_scan(&self) -> bool {
        let mut session = self.session.lock().await;
        self.stop_locked(&mut session, ScanStopReason::Requested).await
    }

    pub async fn status(&self) -> ScanStatus {
        let session = self.session.lock().await;
        ScanStatus {
            active: session.active,
            deadline: session.deadline,
        }
    }

    async fn start_locked(
        &self,
        session: &mut ScanSession,
    ) -> Result<DateTime<Utc>, TransportError> {
        if let Err(e) = self.transport.check_available().await {
            error!("Cannot start scan: {}", e);
            return Err(e);
        }

        self.roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let duration = self.config.duration();
        let deadline = Utc::now()
            + TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::seconds(10));

        session.generation += 1;
        session.cancel_token = CancellationToken::new();
        self.arm_auto_stop(session.generation, duration, session.cancel_token.clone());
        session.active = true;
        session.deadline = Some(deadline);

        let scan = ScanHandle(session.generation);
        if let Err(e) = self.transport.start_scan(scan, self.sink.clone()).await {
            error!("Failed to start scan: {}", e);
            session.active = false;
            session.deadline = None;
            session.cancel_token.cancel();
            return Err(e);
        }

        let _ = self.events.send(ManagerEvent::ScanStarted { deadline });
        info!("Device scan started, stopping at {}.", deadline);
        Ok(deadline)
    }

    fn arm_auto_stop(&self, generation: u64, duration: Duration, cancel_token: CancellationToken) {
        let scanner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    scanner.stop_generation(generation).await;
                }
                _ = cancel_token.cancelled() => {
                    debug!("Auto-stop for scan #{} cancelled.", generation);
                }
            }
        });
    }

    async fn stop_generation(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            debug!("Ignoring stale auto-stop for scan #{}.", generation);
            return;
        }
        info!("Scan window elapsed.");
        self.stop_locked(&mut session, ScanStopReason::TimedOut).await;
    }

    async fn stop_locked(&self, session: &mut ScanSession, reason: ScanStopReason) -> bool {
        if !session.active {
            debug!("No active scan to stop.");
            return false;
        }
        session.active = false;
        session.deadline = None;
        session.cancel_token.cancel();

        info!("Stopping Bluetooth scan.");
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Transport reported an error while stopping the scan: {}", e);
        }
        let _ = self.events.send(ManagerEvent::ScanStopped { reason });
        true
    }

    /// Called when the transport reports that scanning failed. Not retried.
    /// Failures from an earlier session are ignored.
    pub async fn fail_session(&self, scan: ScanHandle, message: String) {
        let mut session = self.session.lock().await;
        if scan.0 != session.generation {
            debug!("Ignoring failure of stale {}: {}", scan, message);
            return;
        }
        error!("Scan failed: {}", message);
        let _ = self.events.send(ManagerEvent::ScanFailed {
            message: message.clone(),
        });
        if session.active {
            session.active = false;
            session.deadline = None;
            session.cancel_token.cancel();
            let _ = self.events.send(ManagerEvent::ScanStopped {
                reason: ScanStopReason::Failed,
            });
        }
    }

    /// Merges one sighting into the roster if a session is running and it passes the filters
    pub async fn handle_advertisement(&self, advertisement: Advertisement) {
        if !self.session.lock().await.active {
            debug!("Dropping late advertisement from {}", advertisement.id);
            return;
        }
        if !self.passes_filters(&advertisement) {
            return;
        }

        let outcome = self
            .roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(&advertisement);

        match outcome {
            Upsert::Inserted(record) => {
                info!(
                    "Found device: Address: {:?}, ID: {}, Name: {:?}, RSSI: {:?}",
                    record.address, record.id, record.display_name, record.rssi
                );
                let _ = self.events.send(ManagerEvent::DeviceFound(record));
            }
            Upsert::Updated(record) => {
                debug!("Updated device {}: {:?}", record.identity_key(), record.display_name);
                let _ = self.events.send(ManagerEvent::DeviceUpdated(record));
            }
            Upsert::Unchanged => {}
        }
    }

    fn passes_filters(&self, advertisement: &Advertisement) -> bool {
        if let Some(min_rssi) = self.config.min_rssi {
            match advertisement.rssi {
                Some(rssi) if rssi >= min_rssi => {}
                _ => return false,
            }
        }
        if let Some(filter) = self.config.name_filter.as_deref() {
            let name = resolve_display_name(
                advertisement.local_name.as_deref(),
                advertisement.device_name.as_deref(),
            );
            if !name.to_lowercase().contains(&filter.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
