use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use strum_macros::Display;
use tokio::sync::watch;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::resolver::{AttributeContainer, ModelResolver};
use crate::attribute::{AttributeMap, ChangeReceiver, ChangeSignal};
use crate::error::ModelError;
use crate::hw::{Advertisement, PeripheralEvent, PeripheralId};
use crate::sync::{BridgeState, CommandKind, CommandSender, SyncBridge, TransportCommand};

/// A client-side description of a peripheral's attributes.
pub trait DeviceModel: AttributeContainer + Send + Sync + 'static {
    /// Builds a fresh model the first time a peripheral is seen.
    fn from_advertisement(advertisement: &Advertisement) -> Self;

    /// Services a peripheral must advertise to be considered; empty accepts all.
    fn advertised_services() -> Vec<Uuid> {
        Vec::new()
    }

    /// Services whose characteristics are discovered; `None` discovers all.
    fn services_to_discover() -> Option<Vec<Uuid>> {
        None
    }
}

/// Link state of a device as seen by the application.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A discovered peripheral together with its live model.
///
/// Cloning is cheap and yields a handle to the same device. Two handles are
/// equal when they refer to the same peripheral.
pub struct Device<M> {
    inner: Arc<DeviceInner<M>>,
}

struct DeviceInner<M> {
    id: PeripheralId,
    model: M,
    advertisement: Mutex<Advertisement>,
    signal: ChangeSignal,
    connection: watch::Sender<ConnectionState>,
    attributes: AttributeMap,
    bridge: Mutex<SyncBridge>,
    commands: CommandSender,
}

impl<M: DeviceModel> Device<M> {
    /// Builds the model from its first advertisement and resolves its attributes.
    pub(crate) fn new(
        advertisement: Advertisement,
        commands: CommandSender,
        resolver: &ModelResolver,
    ) -> Result<Self, ModelError> {
        let id = advertisement.peripheral().clone();
        let model = M::from_advertisement(&advertisement);
        let signal = ChangeSignal::new();
        let attributes = resolver.resolve(&model, &signal)?;
        let bridge = SyncBridge::new(
            id.clone(),
            attributes.clone(),
            commands.clone(),
            M::services_to_discover(),
        );
        let (connection, _receiver) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(DeviceInner {
                id,
                model,
                advertisement: Mutex::new(advertisement),
                signal,
                connection,
                attributes,
                bridge: Mutex::new(bridge),
                commands,
            }),
        })
    }

    /// Returns the user-defined model.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.inner.model
    }
}

impl<M> Device<M> {
    #[must_use]
    pub fn id(&self) -> &PeripheralId {
        &self.inner.id
    }

    /// Returns the most recent advertisement.
    #[must_use]
    pub fn advertisement(&self) -> Advertisement {
        self.inner
            .advertisement
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    /// Observes connection state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Subscribes to any change of the model: attribute values and connection state.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        self.inner.signal.subscribe()
    }

    /// Returns the model's resolved attribute map.
    #[must_use]
    pub fn attributes(&self) -> &AttributeMap {
        &self.inner.attributes
    }

    /// Returns how many attributes are bound to a live characteristic.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.inner.attributes.bound_count()
    }

    #[must_use]
    pub fn bridge_state(&self) -> BridgeState {
        self.bridge().state()
    }

    #[must_use]
    pub fn watch_bridge_state(&self) -> watch::Receiver<BridgeState> {
        self.bridge().watch_state()
    }

    /// Requests a connection; the outcome arrives as a transport event.
    ///
    /// Has no effect unless the device is disconnected.
    #[instrument(skip(self), level = "debug", fields(peripheral = %self.inner.id))]
    pub fn connect(&self) {
        let _bridge = self.bridge();
        if self.state() != ConnectionState::Disconnected {
            trace!("connection already requested");
            return;
        }
        self.set_state(ConnectionState::Connecting);
        self.send(CommandKind::Connect);
    }

    /// Requests a disconnection; the outcome arrives as a transport event.
    ///
    /// Requests still queued or in flight for this device are abandoned, a
    /// pending connection attempt included.
    #[instrument(skip(self), level = "debug", fields(peripheral = %self.inner.id))]
    pub fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            trace!("already disconnected");
            return;
        }
        self.send(CommandKind::Disconnect);
    }

    pub(crate) fn update_advertisement(&self, advertisement: Advertisement) {
        *self
            .inner
            .advertisement
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = advertisement;
    }

    /// Applies one transport event for this peripheral.
    pub(crate) fn handle_event(&self, event: &PeripheralEvent) {
        let mut bridge = self.bridge();
        bridge.handle(event);
        match event {
            PeripheralEvent::Connected => self.set_state(ConnectionState::Connected),
            PeripheralEvent::Disconnected => self.set_state(ConnectionState::Disconnected),
            _ => {}
        }
    }

    fn bridge(&self) -> MutexGuard<'_, SyncBridge> {
        self.inner
            .bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, kind: CommandKind) {
        let command = TransportCommand {
            peripheral: self.inner.id.clone(),
            kind,
            epoch: None,
        };
        if self.inner.commands.send(command).is_err() {
            debug!(peripheral = %self.inner.id, "discovery session closed, dropping request");
        }
    }

    /// Moves along disconnected, connecting, connected; never skips connecting.
    fn set_state(&self, next: ConnectionState) {
        let current = self.state();
        match (current, next) {
            (current, next) if current == next => return,
            (ConnectionState::Connected, ConnectionState::Connecting) => return,
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                self.publish_state(ConnectionState::Connecting);
            }
            _ => {}
        }
        self.publish_state(next);
    }

    fn publish_state(&self, state: ConnectionState) {
        let previous = self.inner.connection.send_replace(state);
        debug!(peripheral = %self.inner.id, %previous, next = %state, "connection state changed");
        self.inner.signal.notify();
    }
}

impl<M> Clone for Device<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> PartialEq for Device<M> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<M> Eq for Device<M> {}

impl<M> Hash for Device<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<M> fmt::Debug for Device<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("attributes", &self.inner.attributes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::attribute::{Attribute, AttributeId};
    use crate::hw::CharacteristicInfo;
    use crate::model::AttributeRegistry;
    use crate::sync::CommandReceiver;

    struct Lamp {
        power: Attribute<bool>,
    }

    impl AttributeContainer for Lamp {
        fn register_attributes(&self, registry: &mut AttributeRegistry) {
            registry.attribute(&self.power);
        }
    }

    impl DeviceModel for Lamp {
        fn from_advertisement(_advertisement: &Advertisement) -> Self {
            Self {
                power: Attribute::new(AttributeId::from_u16(0x2B00), false),
            }
        }
    }

    fn lamp(id: &str) -> (Device<Lamp>, CommandReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let advertisement = Advertisement::builder().peripheral(id).rssi(-40).build();
        let device = Device::new(advertisement, sender, &ModelResolver::default())
            .expect("lamp model should resolve");
        (device, receiver)
    }

    #[test]
    fn equality_follows_peripheral_identity() {
        let (first, _commands) = lamp("AA:01");
        let (same, _other_commands) = lamp("AA:01");
        let (other, _third_commands) = lamp("AA:02");

        assert_eq!(first, same);
        assert_ne!(first, other);
    }

    #[test]
    fn connect_moves_through_connecting() {
        let (device, mut commands) = lamp("AA:01");
        let mut states = device.watch_state();

        device.connect();
        assert_eq!(ConnectionState::Connecting, device.state());
        assert_matches!(commands.try_recv(), Ok(command) => {
            assert_eq!(CommandKind::Connect, command.kind);
            assert!(command.epoch.is_none());
        });

        device.connect();
        assert!(commands.try_recv().is_err());

        device.handle_event(&PeripheralEvent::Connected);
        assert_eq!(ConnectionState::Connected, *states.borrow_and_update());
        assert_eq!(BridgeState::ServicesDiscovering, device.bridge_state());
    }

    #[test]
    fn unsolicited_connection_never_skips_connecting() {
        let (device, _commands) = lamp("AA:01");
        let changes = device.subscribe();

        device.handle_event(&PeripheralEvent::Connected);

        assert_eq!(ConnectionState::Connected, device.state());
        assert_eq!(2, changes.generation());
    }

    #[test]
    fn disconnect_event_unbinds_and_flips_state() {
        let (device, _commands) = lamp("AA:01");
        let service = AttributeId::from_u16(0x1815).uuid();
        device.handle_event(&PeripheralEvent::Connected);
        device.handle_event(&PeripheralEvent::ServicesDiscovered {
            services: vec![service],
        });
        device.handle_event(&PeripheralEvent::CharacteristicsDiscovered {
            service,
            characteristics: vec![CharacteristicInfo::new(
                AttributeId::from_u16(0x2B00),
                CharPropFlags::READ | CharPropFlags::WRITE,
            )],
        });
        assert_eq!(1, device.bound_count());

        device.handle_event(&PeripheralEvent::Disconnected);

        assert_eq!(ConnectionState::Disconnected, device.state());
        assert_eq!(BridgeState::Idle, device.bridge_state());
        assert_eq!(0, device.bound_count());
    }

    #[test]
    fn attribute_changes_reach_device_subscribers() {
        let (device, _commands) = lamp("AA:01");
        let changes = device.subscribe();

        device.model().power.set_local(true);

        assert!(changes.has_changed());
    }
}
