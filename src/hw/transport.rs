use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bon::Builder;
use btleplug::api::CharPropFlags;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;
use uuid::Uuid;

use crate::attribute::AttributeId;
use crate::error::TransportError;

/// Stable transport-level identifier of a remote peripheral.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    derive_more::Display,
    derive_more::From,
    serde::Serialize,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One advertisement sighting reported during a scan.
#[derive(Debug, Clone, Eq, PartialEq, Builder)]
pub struct Advertisement {
    #[builder(into)]
    peripheral: PeripheralId,
    #[builder(into)]
    local_name: Option<String>,
    rssi: Option<i16>,
    #[builder(default)]
    services: Vec<Uuid>,
    #[builder(default)]
    manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    /// Returns the advertising peripheral.
    #[must_use]
    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the received signal strength, if reported.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns the advertised service UUIDs.
    #[must_use]
    pub fn services(&self) -> &[Uuid] {
        &self.services
    }

    /// Returns manufacturer-specific data keyed by company identifier.
    #[must_use]
    pub fn manufacturer_data(&self) -> &HashMap<u16, Vec<u8>> {
        &self.manufacturer_data
    }

    /// Returns whether the advertisement lists every service in `required`.
    pub(crate) fn advertises_all(&self, required: &[Uuid]) -> bool {
        required.iter().all(|uuid| self.services.contains(uuid))
    }
}

/// A characteristic reported by characteristic discovery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CharacteristicInfo {
    id: AttributeId,
    properties: CharPropFlags,
}

impl CharacteristicInfo {
    /// Creates a characteristic description.
    #[must_use]
    pub fn new(id: AttributeId, properties: CharPropFlags) -> Self {
        Self { id, properties }
    }

    /// Returns the characteristic identifier.
    #[must_use]
    pub fn id(&self) -> AttributeId {
        self.id
    }

    /// Returns the GATT property flags.
    #[must_use]
    pub fn properties(&self) -> CharPropFlags {
        self.properties
    }

    /// Returns whether the peripheral can push values through notify or indicate.
    #[must_use]
    pub fn supports_push(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }
}

/// Events a transport reports about one connected (or connecting) peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PeripheralEvent {
    /// The link is up.
    Connected,
    /// The link went down, or a connection attempt failed.
    Disconnected,
    /// Service discovery completed.
    ServicesDiscovered { services: Vec<Uuid> },
    /// Characteristic discovery completed for one service.
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    /// A read response or a notification carried a new value.
    ValueUpdated {
        characteristic: AttributeId,
        value: Vec<u8>,
    },
    /// A write request was acknowledged, successfully or not.
    WriteAcknowledged {
        characteristic: AttributeId,
        success: bool,
    },
    /// The notification/indication state of a characteristic changed.
    NotifyStateChanged {
        characteristic: AttributeId,
        notifying: bool,
    },
}

/// Everything a transport reports asynchronously.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    Advertisement(Advertisement),
    Peripheral {
        peripheral: PeripheralId,
        event: PeripheralEvent,
    },
}

impl TransportEvent {
    pub(crate) fn peripheral(peripheral: PeripheralId, event: PeripheralEvent) -> Self {
        Self::Peripheral { peripheral, event }
    }
}

/// Stream of asynchronous transport events.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Subscribes to a backend's event fan-out, skipping over lagged events.
pub(crate) fn broadcast_events(sender: &broadcast::Sender<TransportEvent>) -> EventStream {
    let stream = BroadcastStream::new(sender.subscribe()).filter_map(|event| match event {
        Ok(event) => Some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "transport event subscriber lagged behind");
            None
        }
    });
    Box::pin(stream)
}

/// Radio capability consumed by the synchronization engine.
///
/// Every request is asynchronous in the GATT sense: returning `Ok` means the
/// request was issued, and its outcome arrives later on [`GattTransport::events`].
#[async_trait]
pub trait GattTransport: Send + Sync + fmt::Debug {
    /// Opens a stream of transport events.
    async fn events(&self) -> Result<EventStream, TransportError>;

    /// Starts scanning, optionally restricted to peripherals advertising `services`.
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    /// Stops scanning.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Requests a connection; the outcome is reported as `Connected` or `Disconnected`.
    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Requests a disconnection.
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Requests discovery of all services.
    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Requests discovery of all characteristics of one service.
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError>;

    /// Requests a read; the value arrives as `ValueUpdated`.
    async fn read_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
    ) -> Result<(), TransportError>;

    /// Requests a write with response; the outcome arrives as `WriteAcknowledged`.
    async fn write_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Enables or disables notifications; the outcome arrives as `NotifyStateChanged`.
    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
        enabled: bool,
    ) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CharPropFlags::NOTIFY, true)]
    #[case(CharPropFlags::INDICATE | CharPropFlags::READ, true)]
    #[case(CharPropFlags::READ | CharPropFlags::WRITE, false)]
    fn supports_push_checks_notify_and_indicate(
        #[case] properties: CharPropFlags,
        #[case] expected: bool,
    ) {
        let info = CharacteristicInfo::new(AttributeId::from_u16(0x2A19), properties);
        assert_eq!(expected, info.supports_push());
    }

    #[test]
    fn advertises_all_requires_every_service() {
        let battery = AttributeId::from_u16(0x180F).uuid();
        let device_info = AttributeId::from_u16(0x180A).uuid();
        let advertisement = Advertisement::builder()
            .peripheral("AA:BB")
            .services(vec![battery])
            .build();

        assert!(advertisement.advertises_all(&[]));
        assert!(advertisement.advertises_all(&[battery]));
        assert!(!advertisement.advertises_all(&[battery, device_info]));
    }
}
