//! In-memory radio used by the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use brainstim_controller_lib::core::bluetooth::{
    Advertisement, CharacteristicInfo, EventSink, LinkEvent, LinkHandle, ManagerEvent,
    RadioTransport, ScanHandle, TransportError, TransportEvent, WriteMode,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const COMMAND_CHAR: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_0080_5f9b_34fb);

#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    pub link: LinkHandle,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

#[derive(Debug)]
pub struct MockState {
    pub sink: Option<EventSink>,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub scans: Vec<ScanHandle>,
    pub connects: Vec<(String, LinkHandle)>,
    pub disconnects: Vec<LinkHandle>,
    /// Links the transport currently holds, in connect order
    pub open_links: Vec<LinkHandle>,
    pub writes: Vec<WriteCall>,
    pub characteristics: Vec<CharacteristicInfo>,
    pub unavailable: Option<TransportError>,
    pub connect_error: Option<TransportError>,
    pub write_error: Option<TransportError>,
    /// Report the link as connected from inside `connect`
    pub auto_connect: bool,
    /// How long `connect` takes before the link exists
    pub connect_delay: Option<Duration>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            sink: None,
            start_calls: 0,
            stop_calls: 0,
            scans: Vec::new(),
            connects: Vec::new(),
            disconnects: Vec::new(),
            open_links: Vec::new(),
            writes: Vec::new(),
            characteristics: vec![CharacteristicInfo {
                uuid: COMMAND_CHAR,
                write: true,
                write_without_response: true,
            }],
            unavailable: None,
            connect_error: None,
            write_error: None,
            auto_connect: true,
            connect_delay: None,
        }
    }
}

/// Cloneable handle; tests keep one clone after giving the other to the manager
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: TransportEvent) {
        let sink = self.state().sink.clone().expect("transport has no event sink yet");
        sink.send(event).unwrap();
    }

    pub fn advertise(&self, id: &str, address: Option<&str>, name: Option<&str>, rssi: i16) {
        self.emit(TransportEvent::Discovered(Advertisement {
            id: id.to_string(),
            local_name: name.map(str::to_string),
            device_name: None,
            address: address.map(str::to_string),
            rssi: Some(rssi),
        }));
    }

    /// Reports a scan failure for the given session
    pub fn fail_scan(&self, scan: ScanHandle, message: &str) {
        self.emit(TransportEvent::ScanFailed(scan, message.to_string()));
    }

    pub fn last_scan(&self) -> ScanHandle {
        *self.state().scans.last().expect("no scan started")
    }

    pub fn drop_link(&self, link: LinkHandle) {
        self.emit(TransportEvent::Link(link, LinkEvent::Disconnected));
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.state().writes.clone()
    }
}

#[async_trait]
impl RadioTransport for MockTransport {
    async fn check_available(&self) -> Result<(), TransportError> {
        match &self.state().unavailable {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn start_scan(&self, scan: ScanHandle, sink: EventSink) -> Result<(), TransportError> {
        let mut state = self.state();
        state.start_calls += 1;
        state.scans.push(scan);
        state.sink = Some(sink);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().stop_calls += 1;
        Ok(())
    }

    async fn connect(
        &self,
        peripheral_id: &str,
        link: LinkHandle,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state();
            state.connects.push((peripheral_id.to_string(), link));
            state.sink = Some(sink.clone());
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(e) = &state.connect_error {
            return Err(e.clone());
        }
        state.open_links.push(link);
        if state.auto_connect {
            let _ = sink.send(TransportEvent::Link(link, LinkEvent::Connected));
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        _link: LinkHandle,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        Ok(self.state().characteristics.clone())
    }

    async fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnects.push(link);
        match state.open_links.iter().position(|l| *l == link) {
            Some(i) => {
                state.open_links.remove(i);
                Ok(())
            }
            None => Err(TransportError::UnknownLink(link.to_string())),
        }
    }

    async fn write(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.writes.push(WriteCall {
            link,
            characteristic,
            data: data.to_vec(),
            mode,
        });
        match &state.write_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Waits for the first event matching `pred`, skipping the rest
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<ManagerEvent>, pred: F) -> ManagerEvent
where
    F: Fn(&ManagerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Lets the event pump and spawned tasks drain
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
