//! Radio transport abstraction
//! The platform radio (advertisement parsing, GATT enumeration) sits behind this trait so the
//! discovery and connection logic can be driven by any backend.

use async_trait::async_trait;

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::types::{
    CharacteristicInfo, EventSink, LinkHandle, ScanHandle, WriteMode,
};

#[async_trait]
pub trait RadioTransport: Send + Sync + 'static {
    /// Fails when the adapter is absent, powered off or not permitted
    async fn check_available(&self) -> Result<(), TransportError>;

    /// Starts delivering `TransportEvent::Discovered` into `sink`.
    /// A failure after this returns is reported as `TransportEvent::ScanFailed` tagged with `scan`.
    async fn start_scan(&self, scan: ScanHandle, sink: EventSink) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Initiates a connection to the peripheral with platform id `peripheral_id`.
    /// Link state changes for `link` are reported through `sink`.
    async fn connect(
        &self,
        peripheral_id: &str,
        link: LinkHandle,
        sink: EventSink,
    ) -> Result<(), TransportError>;

    /// Enumerates the characteristics of the connected peripheral
    async fn discover_services(&self, link: LinkHandle)
    -> Result<Vec<CharacteristicInfo>, TransportError>;

    async fn disconnect(&self, link: LinkHandle) -> Result<(), TransportError>;

    async fn write(
        &self,
        link: LinkHandle,
        characteristic: uuid::Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;
}
