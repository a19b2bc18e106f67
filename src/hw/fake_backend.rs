use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bon::Builder;
use btleplug::api::CharPropFlags;
use tokio::sync::broadcast;
use tracing::{instrument, trace};
use uuid::Uuid;

use super::transport::{
    Advertisement, CharacteristicInfo, EventStream, GattTransport, PeripheralEvent, PeripheralId,
    TransportEvent, broadcast_events,
};
use crate::attribute::AttributeId;
use crate::error::{FixtureError, TransportError};

const EVENT_CAPACITY: usize = 256;

const GENERIC_ACCESS_SERVICE: u16 = 0x1800;
const DEVICE_NAME: u16 = 0x2A00;
const BATTERY_SERVICE: u16 = 0x180F;
const BATTERY_LEVEL: u16 = 0x2A19;

/// One characteristic exposed by a fake peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakeCharacteristic {
    id: AttributeId,
    properties: CharPropFlags,
    value: Vec<u8>,
}

impl FakeCharacteristic {
    #[must_use]
    pub fn new(id: AttributeId, properties: CharPropFlags, value: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            properties,
            value: value.into(),
        }
    }

    fn info(&self) -> CharacteristicInfo {
        CharacteristicInfo::new(self.id, self.properties)
    }
}

/// One service exposed by a fake peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakeService {
    uuid: Uuid,
    characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// A scripted peripheral served by [`FakeTransport`].
#[derive(Debug, Clone, Eq, PartialEq, Builder)]
pub struct FakePeripheral {
    #[builder(into)]
    id: PeripheralId,
    #[builder(into)]
    local_name: Option<String>,
    rssi: Option<i16>,
    #[builder(default)]
    advertised_services: Vec<Uuid>,
    #[builder(default)]
    services: Vec<FakeService>,
    /// Acknowledge every write as failed.
    #[builder(default)]
    reject_writes: bool,
}

impl FakePeripheral {
    #[must_use]
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Builds the advertisement this peripheral broadcasts.
    #[must_use]
    pub fn advertisement(&self) -> Advertisement {
        Advertisement::builder()
            .peripheral(self.id.clone())
            .maybe_local_name(self.local_name.clone())
            .maybe_rssi(self.rssi)
            .services(self.advertised_services.clone())
            .build()
    }

    fn service(&self, uuid: Uuid) -> Option<&FakeService> {
        self.services.iter().find(|service| service.uuid == uuid)
    }

    fn characteristic_mut(&mut self, id: AttributeId) -> Option<&mut FakeCharacteristic> {
        self.services
            .iter_mut()
            .flat_map(|service| service.characteristics.iter_mut())
            .find(|characteristic| characteristic.id == id)
    }
}

/// Parsed fake peripheral fixture: `id|name|rssi[|battery_hex];...`.
///
/// `-` leaves the name or RSSI unset. Every peripheral exposes its name as the
/// GAP device-name characteristic; a fourth field adds a notifying Battery
/// Service with that battery level.
#[derive(Debug, Clone, derive_more::Into)]
pub struct FakePeripherals {
    peripherals: Vec<FakePeripheral>,
}

impl FromStr for FakePeripherals {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }
        let peripherals = value
            .split(';')
            .map(parse_peripheral_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { peripherals })
    }
}

fn parse_peripheral_record(raw_record: &str) -> Result<FakePeripheral, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if !(3..=4).contains(&fields.len()) {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let local_name = (fields[1] != "-").then(|| fields[1].to_string());
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };

    let device_name = FakeCharacteristic::new(
        AttributeId::from_u16(DEVICE_NAME),
        CharPropFlags::READ,
        local_name.clone().unwrap_or_default(),
    );
    let mut services = vec![
        FakeService::new(AttributeId::from_u16(GENERIC_ACCESS_SERVICE).uuid())
            .with_characteristic(device_name),
    ];
    let mut advertised_services = Vec::new();
    if let Some(battery) = fields.get(3) {
        let level = hex::decode(battery).map_err(|source| FixtureError::InvalidHex {
            value: (*battery).to_string(),
            source,
        })?;
        let battery_service = AttributeId::from_u16(BATTERY_SERVICE).uuid();
        services.push(
            FakeService::new(battery_service).with_characteristic(FakeCharacteristic::new(
                AttributeId::from_u16(BATTERY_LEVEL),
                CharPropFlags::READ | CharPropFlags::NOTIFY,
                level,
            )),
        );
        advertised_services.push(battery_service);
    }

    Ok(FakePeripheral::builder()
        .id(fields[0])
        .maybe_local_name(local_name)
        .maybe_rssi(rssi)
        .advertised_services(advertised_services)
        .services(services)
        .build())
}

/// Whether the fake transport answers requests by itself.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum ResponseMode {
    /// Every request is answered immediately with the matching event.
    #[default]
    Automatic,
    /// Requests are only recorded; tests inject events with [`FakeTransport::emit`].
    Manual,
}

/// A request received by [`FakeTransport`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportCall {
    StartScan { services: Vec<Uuid> },
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid),
    Read(PeripheralId, AttributeId),
    Write(PeripheralId, AttributeId, Vec<u8>),
    SetNotify(PeripheralId, AttributeId, bool),
}

/// In-memory transport serving scripted peripherals and recording every request.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    state: Arc<FakeState>,
}

#[derive(Debug)]
struct FakeState {
    events: broadcast::Sender<TransportEvent>,
    links: Mutex<Vec<FakeLink>>,
    calls: Mutex<Vec<TransportCall>>,
    mode: ResponseMode,
}

#[derive(Debug)]
struct FakeLink {
    peripheral: FakePeripheral,
    connected: bool,
    subscribed: HashSet<AttributeId>,
}

impl FakeTransport {
    /// Creates an automatically responding transport.
    #[must_use]
    pub fn new(peripherals: impl IntoIterator<Item = FakePeripheral>) -> Self {
        Self::with_mode(peripherals, ResponseMode::Automatic)
    }

    #[must_use]
    pub fn with_mode(
        peripherals: impl IntoIterator<Item = FakePeripheral>,
        mode: ResponseMode,
    ) -> Self {
        let (events, _receiver) = broadcast::channel(EVENT_CAPACITY);
        let links = peripherals
            .into_iter()
            .map(|peripheral| FakeLink {
                peripheral,
                connected: false,
                subscribed: HashSet::new(),
            })
            .collect();
        Self {
            state: Arc::new(FakeState {
                events,
                links: Mutex::new(links),
                calls: Mutex::new(Vec::new()),
                mode,
            }),
        }
    }

    /// Returns every request received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock_calls().clone()
    }

    /// Returns how many received requests satisfy `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.lock_calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn clear_calls(&self) {
        self.lock_calls().clear();
    }

    /// Injects an event as if the radio had reported it.
    pub fn emit(&self, event: TransportEvent) {
        trace!(?event, "fake transport event");
        if self.state.events.send(event).is_err() {
            trace!("no event subscribers");
        }
    }

    /// Broadcasts the advertisement of a known peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownPeripheral`] for an unknown identifier.
    pub fn advertise(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let advertisement = self.with_link(peripheral, |link| Ok(link.peripheral.advertisement()))?;
        self.emit(TransportEvent::Advertisement(advertisement));
        Ok(())
    }

    /// Changes a remote value, notifying it when the characteristic is subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown peripheral or characteristic.
    pub fn set_remote_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let value = value.into();
        let notify = self.with_link(peripheral, |link| {
            let target = link.peripheral.characteristic_mut(characteristic).ok_or_else(|| {
                TransportError::UnknownCharacteristic {
                    peripheral: peripheral.clone(),
                    characteristic,
                }
            })?;
            target.value.clone_from(&value);
            Ok(link.connected && link.subscribed.contains(&characteristic))
        })?;

        if notify {
            self.emit_peripheral(
                peripheral,
                PeripheralEvent::ValueUpdated {
                    characteristic,
                    value,
                },
            );
        }
        Ok(())
    }

    /// Simulates the peripheral dropping the link.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownPeripheral`] for an unknown identifier.
    pub fn drop_connection(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.with_link(peripheral, |link| {
            link.connected = false;
            link.subscribed.clear();
            Ok(())
        })?;
        self.emit_peripheral(peripheral, PeripheralEvent::Disconnected);
        Ok(())
    }

    /// Returns whether the fake link to `peripheral` is up.
    #[must_use]
    pub fn is_connected(&self, peripheral: &PeripheralId) -> bool {
        self.with_link(peripheral, |link| Ok(link.connected))
            .unwrap_or(false)
    }

    fn record(&self, call: TransportCall) {
        trace!(?call, "fake transport request");
        self.lock_calls().push(call);
    }

    fn automatic(&self) -> bool {
        self.state.mode == ResponseMode::Automatic
    }

    fn emit_peripheral(&self, peripheral: &PeripheralId, event: PeripheralEvent) {
        self.emit(TransportEvent::peripheral(peripheral.clone(), event));
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<TransportCall>> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_link<R>(
        &self,
        peripheral: &PeripheralId,
        action: impl FnOnce(&mut FakeLink) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut links = self
            .state
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let link = links
            .iter_mut()
            .find(|link| link.peripheral.id == *peripheral)
            .ok_or_else(|| TransportError::UnknownPeripheral {
                peripheral: peripheral.clone(),
            })?;
        action(link)
    }

    fn with_connected_link<R>(
        &self,
        peripheral: &PeripheralId,
        action: impl FnOnce(&mut FakeLink) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        self.with_link(peripheral, |link| {
            if !link.connected {
                return Err(TransportError::NotConnected {
                    peripheral: peripheral.clone(),
                });
            }
            action(link)
        })
    }
}

#[async_trait]
impl GattTransport for FakeTransport {
    async fn events(&self) -> Result<EventStream, TransportError> {
        Ok(broadcast_events(&self.state.events))
    }

    #[instrument(skip(self), level = "trace")]
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.record(TransportCall::StartScan {
            services: services.to_vec(),
        });
        if !self.automatic() {
            return Ok(());
        }

        let advertisements: Vec<_> = self
            .state
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|link| link.peripheral.advertisement())
            .filter(|advertisement| advertisement.advertises_all(services))
            .collect();
        for advertisement in advertisements {
            self.emit(TransportEvent::Advertisement(advertisement));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.record(TransportCall::Connect(peripheral.clone()));
        if !self.automatic() {
            return Ok(());
        }
        self.with_link(peripheral, |link| {
            link.connected = true;
            Ok(())
        })?;
        self.emit_peripheral(peripheral, PeripheralEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect(peripheral.clone()));
        if !self.automatic() {
            return Ok(());
        }
        self.drop_connection(peripheral)
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.record(TransportCall::DiscoverServices(peripheral.clone()));
        if !self.automatic() {
            return Ok(());
        }
        let services = self.with_connected_link(peripheral, |link| {
            Ok(link
                .peripheral
                .services
                .iter()
                .map(|service| service.uuid)
                .collect())
        })?;
        self.emit_peripheral(peripheral, PeripheralEvent::ServicesDiscovered { services });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::DiscoverCharacteristics(
            peripheral.clone(),
            service,
        ));
        if !self.automatic() {
            return Ok(());
        }
        let characteristics = self.with_connected_link(peripheral, |link| {
            let found = link.peripheral.service(service).ok_or_else(|| {
                TransportError::UnknownService {
                    peripheral: peripheral.clone(),
                    service,
                }
            })?;
            Ok(found
                .characteristics
                .iter()
                .map(FakeCharacteristic::info)
                .collect())
        })?;
        self.emit_peripheral(
            peripheral,
            PeripheralEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            },
        );
        Ok(())
    }

    async fn read_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Read(peripheral.clone(), characteristic));
        if !self.automatic() {
            return Ok(());
        }
        let value = self.with_connected_link(peripheral, |link| {
            link.peripheral
                .characteristic_mut(characteristic)
                .map(|found| found.value.clone())
                .ok_or_else(|| TransportError::UnknownCharacteristic {
                    peripheral: peripheral.clone(),
                    characteristic,
                })
        })?;
        self.emit_peripheral(
            peripheral,
            PeripheralEvent::ValueUpdated {
                characteristic,
                value,
            },
        );
        Ok(())
    }

    async fn write_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Write(
            peripheral.clone(),
            characteristic,
            payload.to_vec(),
        ));
        if !self.automatic() {
            return Ok(());
        }
        let success = self.with_connected_link(peripheral, |link| {
            let reject = link.peripheral.reject_writes;
            let target = link
                .peripheral
                .characteristic_mut(characteristic)
                .ok_or_else(|| TransportError::UnknownCharacteristic {
                    peripheral: peripheral.clone(),
                    characteristic,
                })?;
            if !reject {
                target.value = payload.to_vec();
            }
            Ok(!reject)
        })?;
        self.emit_peripheral(
            peripheral,
            PeripheralEvent::WriteAcknowledged {
                characteristic,
                success,
            },
        );
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: AttributeId,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetNotify(
            peripheral.clone(),
            characteristic,
            enabled,
        ));
        if !self.automatic() {
            return Ok(());
        }
        let notifying = self.with_connected_link(peripheral, |link| {
            let pushes = link
                .peripheral
                .characteristic_mut(characteristic)
                .map(|found| found.info().supports_push())
                .ok_or_else(|| TransportError::UnknownCharacteristic {
                    peripheral: peripheral.clone(),
                    characteristic,
                })?;
            let notifying = enabled && pushes;
            if notifying {
                link.subscribed.insert(characteristic);
            } else {
                link.subscribed.remove(&characteristic);
            }
            Ok(notifying)
        })?;
        self.emit_peripheral(
            peripheral,
            PeripheralEvent::NotifyStateChanged {
                characteristic,
                notifying,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio_stream::StreamExt;

    use super::*;

    fn fixture(raw: &str) -> Vec<FakePeripheral> {
        raw.parse::<FakePeripherals>()
            .expect("fixture should parse")
            .into()
    }

    #[rstest]
    #[case("AA:01|Sensor|-43", 1)]
    #[case("AA:01|Sensor|-43|64;AA:02|-|-|10", 2)]
    fn parses_fixture_records(#[case] raw: &str, #[case] expected_count: usize) {
        assert_eq!(expected_count, fixture(raw).len());
    }

    #[rstest]
    #[case("", "empty")]
    #[case("AA:01|Sensor", "field count")]
    #[case("AA:01||-40", "empty field")]
    #[case("AA:01|Sensor|loud", "rssi")]
    #[case("AA:01|Sensor|-40|zz", "hex")]
    fn rejects_malformed_fixtures(#[case] raw: &str, #[case] problem: &str) {
        let result = raw.parse::<FakePeripherals>();
        match problem {
            "empty" => assert_matches!(result, Err(FixtureError::EmptyFixture)),
            "field count" => assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount)),
            "empty field" => assert_matches!(result, Err(FixtureError::EmptyRecordField)),
            "rssi" => assert_matches!(result, Err(FixtureError::InvalidRssi(_))),
            _ => assert_matches!(result, Err(FixtureError::InvalidHex { .. })),
        }
    }

    #[test]
    fn battery_field_adds_an_advertised_battery_service() {
        let peripherals = fixture("AA:01|Sensor|-43|64");
        let advertisement = peripherals[0].advertisement();

        assert_eq!(Some("Sensor"), advertisement.local_name());
        assert_eq!(Some(-43), advertisement.rssi());
        assert_eq!(
            vec![AttributeId::from_u16(BATTERY_SERVICE).uuid()],
            advertisement.services()
        );
    }

    #[tokio::test]
    async fn automatic_mode_answers_requests() {
        let transport = FakeTransport::new(fixture("AA:01|Sensor|-43|64"));
        let peripheral = PeripheralId::from("AA:01");
        let level = AttributeId::from_u16(BATTERY_LEVEL);
        let mut events = transport.events().await.expect("events should open");

        transport.connect(&peripheral).await.expect("connect");
        transport.read_value(&peripheral, level).await.expect("read");

        assert_eq!(
            Some(TransportEvent::peripheral(
                peripheral.clone(),
                PeripheralEvent::Connected
            )),
            events.next().await
        );
        assert_eq!(
            Some(TransportEvent::peripheral(
                peripheral.clone(),
                PeripheralEvent::ValueUpdated {
                    characteristic: level,
                    value: vec![0x64],
                }
            )),
            events.next().await
        );
        assert!(transport.is_connected(&peripheral));
    }

    #[tokio::test]
    async fn requests_fail_before_connecting() {
        let transport = FakeTransport::new(fixture("AA:01|Sensor|-43"));

        let result = transport
            .discover_services(&PeripheralId::from("AA:01"))
            .await;

        assert_matches!(result, Err(TransportError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn manual_mode_only_records() {
        let transport = FakeTransport::with_mode(fixture("AA:01|Sensor|-43"), ResponseMode::Manual);
        let peripheral = PeripheralId::from("AA:01");

        transport.connect(&peripheral).await.expect("connect");

        assert!(!transport.is_connected(&peripheral));
        assert_eq!(vec![TransportCall::Connect(peripheral)], transport.calls());
    }

    #[tokio::test]
    async fn subscribed_values_are_pushed() {
        let transport = FakeTransport::new(fixture("AA:01|Sensor|-43|64"));
        let peripheral = PeripheralId::from("AA:01");
        let level = AttributeId::from_u16(BATTERY_LEVEL);
        transport.connect(&peripheral).await.expect("connect");
        transport
            .set_notify(&peripheral, level, true)
            .await
            .expect("subscribe");
        let mut events = transport.events().await.expect("events should open");

        transport
            .set_remote_value(&peripheral, level, [0x32])
            .expect("value should change");

        assert_eq!(
            Some(TransportEvent::peripheral(
                peripheral,
                PeripheralEvent::ValueUpdated {
                    characteristic: level,
                    value: vec![0x32],
                }
            )),
            events.next().await
        );
    }
}
