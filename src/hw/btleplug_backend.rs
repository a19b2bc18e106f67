use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use super::transport::{
    Advertisement, CharacteristicInfo, EventStream, GattTransport, PeripheralEvent, PeripheralId,
    TransportEvent, broadcast_events,
};
use crate::attribute::AttributeId;
use crate::error::TransportError;

const EVENT_CAPACITY: usize = 1_024;

type PeripheralTable = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

/// Notification forwarders of live connections, one per peripheral.
#[derive(Debug, Clone)]
struct Forwarders {
    tokens: Arc<Mutex<HashMap<PeripheralId, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Forwarders {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            tokens: Arc::default(),
            shutdown,
        }
    }

    /// Returns the token for a new connection's forwarder, stopping the previous one.
    fn start(&self, id: &PeripheralId) -> CancellationToken {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.lock().insert(id.clone(), token.clone()) {
            previous.cancel();
        }
        token
    }

    fn stop(&self, id: &PeripheralId) {
        if let Some(token) = self.lock().remove(id) {
            token.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeripheralId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport backed by the host's first BLE adapter through `btleplug`.
#[derive(Debug)]
pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: PeripheralTable,
    events: broadcast::Sender<TransportEvent>,
    forwarders: Forwarders,
    _shutdown_guard: DropGuard,
}

impl BtleplugTransport {
    /// Opens the first available adapter and starts listening for its events.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoAdapters`] when the host has no BLE adapter.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapters)?;
        info!(adapter = %adapter.adapter_info().await?, "using BLE adapter");

        let (events, _receiver) = broadcast::channel(EVENT_CAPACITY);
        let peripherals = PeripheralTable::default();
        let shutdown = CancellationToken::new();
        let forwarders = Forwarders::new(shutdown.clone());

        let central_events = adapter.events().await?;
        tokio::spawn(forward_central_events(
            adapter.clone(),
            central_events,
            Arc::clone(&peripherals),
            events.clone(),
            forwarders.clone(),
        ));

        Ok(Self {
            adapter,
            peripherals,
            events,
            forwarders,
            _shutdown_guard: shutdown.drop_guard(),
        })
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        lock_table(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral {
                peripheral: id.clone(),
            })
    }

    fn characteristic(
        peripheral: &Peripheral,
        id: &PeripheralId,
        characteristic: AttributeId,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|candidate| candidate.uuid == characteristic.uuid())
            .ok_or_else(|| TransportError::UnknownCharacteristic {
                peripheral: id.clone(),
                characteristic,
            })
    }

    fn emit(&self, peripheral: &PeripheralId, event: PeripheralEvent) {
        let _ = self
            .events
            .send(TransportEvent::peripheral(peripheral.clone(), event));
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn events(&self) -> Result<EventStream, TransportError> {
        Ok(broadcast_events(&self.events))
    }

    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(peripheral = %id))]
    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let notifications = peripheral.notifications().await?;
        tokio::spawn(forward_notifications(
            id.clone(),
            notifications,
            self.events.clone(),
            self.forwarders.start(id),
        ));
        self.emit(id, PeripheralEvent::Connected);
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(peripheral = %id))]
    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.peripheral(id)?.disconnect().await?;
        self.forwarders.stop(id);
        self.emit(id, PeripheralEvent::Disconnected);
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(peripheral = %id))]
    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        peripheral.discover_services().await?;
        let services = peripheral
            .services()
            .into_iter()
            .map(|service| service.uuid)
            .collect();
        self.emit(id, PeripheralEvent::ServicesDiscovered { services });
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(peripheral = %id))]
    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let found = peripheral
            .services()
            .into_iter()
            .find(|candidate| candidate.uuid == service)
            .ok_or_else(|| TransportError::UnknownService {
                peripheral: id.clone(),
                service,
            })?;
        let characteristics = found
            .characteristics
            .iter()
            .map(|characteristic| {
                CharacteristicInfo::new(
                    AttributeId::from(characteristic.uuid),
                    characteristic.properties,
                )
            })
            .collect();
        self.emit(
            id,
            PeripheralEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            },
        );
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(peripheral = %id))]
    async fn read_value(
        &self,
        id: &PeripheralId,
        characteristic: AttributeId,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, id, characteristic)?;
        let value = peripheral.read(&target).await?;
        trace!(payload = %hex::encode(&value), "read completed");
        self.emit(
            id,
            PeripheralEvent::ValueUpdated {
                characteristic,
                value,
            },
        );
        Ok(())
    }

    #[instrument(skip(self, payload), level = "trace", fields(peripheral = %id, payload = %hex::encode(payload)))]
    async fn write_value(
        &self,
        id: &PeripheralId,
        characteristic: AttributeId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, id, characteristic)?;
        peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await?;
        self.emit(
            id,
            PeripheralEvent::WriteAcknowledged {
                characteristic,
                success: true,
            },
        );
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(peripheral = %id))]
    async fn set_notify(
        &self,
        id: &PeripheralId,
        characteristic: AttributeId,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, id, characteristic)?;
        if enabled {
            peripheral.subscribe(&target).await?;
        } else {
            peripheral.unsubscribe(&target).await?;
        }
        self.emit(
            id,
            PeripheralEvent::NotifyStateChanged {
                characteristic,
                notifying: enabled,
            },
        );
        Ok(())
    }
}

fn lock_table(
    table: &PeripheralTable,
) -> MutexGuard<'_, HashMap<PeripheralId, Peripheral>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn forward_central_events(
    adapter: Adapter,
    mut central_events: impl tokio_stream::Stream<Item = CentralEvent> + Unpin,
    peripherals: PeripheralTable,
    events: broadcast::Sender<TransportEvent>,
    forwarders: Forwarders,
) {
    loop {
        let event = tokio::select! {
            () = forwarders.shutdown.cancelled() => break,
            event = central_events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match translate_central_event(&adapter, &peripherals, &forwarders, event).await {
            Ok(Some(event)) => {
                let _ = events.send(event);
            }
            Ok(None) => {}
            Err(error) => debug!(?error, "failed to translate adapter event"),
        }
    }
    trace!("adapter event forwarding stopped");
}

async fn translate_central_event(
    adapter: &Adapter,
    peripherals: &PeripheralTable,
    forwarders: &Forwarders,
    event: CentralEvent,
) -> Result<Option<TransportEvent>, TransportError> {
    match event {
        CentralEvent::DeviceDiscovered(platform_id) | CentralEvent::DeviceUpdated(platform_id) => {
            let peripheral = adapter.peripheral(&platform_id).await?;
            let Some(properties) = peripheral.properties().await? else {
                return Ok(None);
            };
            let id = PeripheralId::from(peripheral.id().to_string());
            lock_table(peripherals).insert(id.clone(), peripheral);
            Ok(Some(TransportEvent::Advertisement(
                advertisement_from_properties(id, properties),
            )))
        }
        CentralEvent::DeviceConnected(platform_id) => Ok(Some(TransportEvent::peripheral(
            PeripheralId::from(platform_id.to_string()),
            PeripheralEvent::Connected,
        ))),
        CentralEvent::DeviceDisconnected(platform_id) => {
            let id = PeripheralId::from(platform_id.to_string());
            forwarders.stop(&id);
            Ok(Some(TransportEvent::peripheral(
                id,
                PeripheralEvent::Disconnected,
            )))
        }
        _ => Ok(None),
    }
}

async fn forward_notifications(
    id: PeripheralId,
    mut notifications: impl tokio_stream::Stream<Item = btleplug::api::ValueNotification> + Unpin,
    events: broadcast::Sender<TransportEvent>,
    connection: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            () = connection.cancelled() => break,
            notification = notifications.next() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };
        let _ = events.send(TransportEvent::peripheral(
            id.clone(),
            PeripheralEvent::ValueUpdated {
                characteristic: AttributeId::from(notification.uuid),
                value: notification.value,
            },
        ));
    }
    trace!(peripheral = %id, "notification forwarding stopped");
}

fn advertisement_from_properties(
    id: PeripheralId,
    properties: PeripheralProperties,
) -> Advertisement {
    Advertisement::builder()
        .peripheral(id)
        .maybe_local_name(properties.local_name)
        .maybe_rssi(properties.rssi)
        .services(properties.services)
        .manufacturer_data(properties.manufacturer_data)
        .build()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn advertisement_preserves_scan_properties() {
        let battery = AttributeId::from_u16(0x180F).uuid();
        let properties = PeripheralProperties {
            local_name: Some("Thermo".to_string()),
            rssi: Some(-51),
            services: vec![battery],
            manufacturer_data: HashMap::from([(0x004C, vec![0x02, 0x15])]),
            ..PeripheralProperties::default()
        };

        let advertisement = advertisement_from_properties(PeripheralId::from("AA:BB"), properties);

        assert_eq!("AA:BB", advertisement.peripheral().as_str());
        assert_eq!(Some("Thermo"), advertisement.local_name());
        assert_eq!(Some(-51), advertisement.rssi());
        assert_eq!(&[battery], advertisement.services());
        assert_eq!(
            Some(&vec![0x02, 0x15]),
            advertisement.manufacturer_data().get(&0x004C)
        );
    }

    #[test]
    fn reconnecting_stops_the_previous_forwarder() {
        let forwarders = Forwarders::new(CancellationToken::new());
        let peripheral = PeripheralId::from("AA:BB");

        let first = forwarders.start(&peripheral);
        let second = forwarders.start(&peripheral);

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn disconnecting_stops_only_that_peripherals_forwarder() {
        let forwarders = Forwarders::new(CancellationToken::new());
        let dropped = forwarders.start(&PeripheralId::from("AA:BB"));
        let kept = forwarders.start(&PeripheralId::from("CC:DD"));

        forwarders.stop(&PeripheralId::from("AA:BB"));

        assert!(dropped.is_cancelled());
        assert!(!kept.is_cancelled());
        forwarders.stop(&PeripheralId::from("AA:BB"));
    }

    #[test]
    fn shutdown_stops_every_forwarder() {
        let shutdown = CancellationToken::new();
        let forwarders = Forwarders::new(shutdown.clone());
        let connection = forwarders.start(&PeripheralId::from("AA:BB"));

        shutdown.cancel();

        assert!(connection.is_cancelled());
    }
}
