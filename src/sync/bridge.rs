use std::collections::HashSet;

use serde::Serialize;
use strum_macros::Display;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use super::command::{Binding, CommandKind, CommandSender};
use crate::attribute::{AttributeId, AttributeMap};
use crate::hw::{CharacteristicInfo, PeripheralEvent, PeripheralId};

/// Progress of binding a device model to a connected peripheral.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    /// Not connected; attributes are unbound.
    Idle,
    /// Waiting for the peripheral's service list.
    ServicesDiscovering,
    /// Waiting for characteristics of one or more services.
    CharacteristicsDiscovering,
    /// Every discovered service has been processed.
    Bound,
}

/// Event-driven state machine binding one model's attributes to a peripheral.
///
/// Each call to [`SyncBridge::handle`] runs one transition to completion; the
/// owner serializes calls so transitions never interleave.
#[derive(Debug)]
pub(crate) struct SyncBridge {
    peripheral: PeripheralId,
    attributes: AttributeMap,
    commands: CommandSender,
    service_filter: Option<Vec<Uuid>>,
    state: watch::Sender<BridgeState>,
    binding: Option<Binding>,
    pending_services: HashSet<Uuid>,
}

impl SyncBridge {
    pub(crate) fn new(
        peripheral: PeripheralId,
        attributes: AttributeMap,
        commands: CommandSender,
        service_filter: Option<Vec<Uuid>>,
    ) -> Self {
        let (state, _receiver) = watch::channel(BridgeState::Idle);
        Self {
            peripheral,
            attributes,
            commands,
            service_filter,
            state,
            binding: None,
            pending_services: HashSet::new(),
        }
    }

    pub(crate) fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub(crate) fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    #[instrument(
        skip(self, event),
        level = "trace",
        fields(peripheral = %self.peripheral, state = %self.state())
    )]
    pub(crate) fn handle(&mut self, event: &PeripheralEvent) {
        match event {
            PeripheralEvent::Connected => self.on_connected(),
            PeripheralEvent::Disconnected => self.on_disconnected(),
            PeripheralEvent::ServicesDiscovered { services } => self.on_services(services),
            PeripheralEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            } => self.on_characteristics(*service, characteristics),
            PeripheralEvent::ValueUpdated {
                characteristic,
                value,
            } => self.on_value(*characteristic, value),
            PeripheralEvent::WriteAcknowledged {
                characteristic,
                success,
            } => self.on_write_acknowledged(*characteristic, *success),
            PeripheralEvent::NotifyStateChanged {
                characteristic,
                notifying,
            } => self.on_notify_state(*characteristic, *notifying),
        }
    }

    fn transition(&self, next: BridgeState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(peripheral = %self.peripheral, %previous, %next, "bridge transition");
        }
    }

    fn on_connected(&mut self) {
        if self.state() != BridgeState::Idle {
            trace!("already connected, ignoring");
            return;
        }

        let binding = Binding::new(self.peripheral.clone(), self.commands.clone());
        self.transition(BridgeState::ServicesDiscovering);
        binding.issue(CommandKind::DiscoverServices);
        self.binding = Some(binding);
    }

    fn on_services(&mut self, services: &[Uuid]) {
        if self.state() != BridgeState::ServicesDiscovering {
            trace!("unexpected service list, ignoring");
            return;
        }
        let Some(binding) = self.binding.clone() else {
            return;
        };

        self.pending_services = services
            .iter()
            .copied()
            .filter(|service| {
                self.service_filter
                    .as_ref()
                    .is_none_or(|filter| filter.contains(service))
            })
            .collect();
        debug!(
            discovered = services.len(),
            selected = self.pending_services.len(),
            "services discovered"
        );

        self.transition(BridgeState::CharacteristicsDiscovering);
        if self.pending_services.is_empty() {
            self.finish_binding();
            return;
        }
        for service in &self.pending_services {
            binding.issue(CommandKind::DiscoverCharacteristics(*service));
        }
    }

    fn on_characteristics(&mut self, service: Uuid, characteristics: &[CharacteristicInfo]) {
        let state = self.state();
        if !matches!(
            state,
            BridgeState::CharacteristicsDiscovering | BridgeState::Bound
        ) {
            trace!(%service, "unexpected characteristic list, ignoring");
            return;
        }
        let Some(binding) = self.binding.clone() else {
            return;
        };

        for characteristic in characteristics {
            let Some(attribute) = self.attributes.get(characteristic.id()) else {
                continue;
            };
            if attribute.is_bound() {
                trace!(
                    %service,
                    characteristic = %characteristic.id(),
                    "characteristic already bound through another service"
                );
                continue;
            }
            let push = characteristic.supports_push();
            if push {
                binding.issue(CommandKind::SetNotify(characteristic.id(), true));
            }
            attribute.mark_discovered(binding.clone(), push);
        }

        self.pending_services.remove(&service);
        if state == BridgeState::CharacteristicsDiscovering && self.pending_services.is_empty() {
            self.finish_binding();
        }
    }

    fn finish_binding(&self) {
        self.transition(BridgeState::Bound);
        info!(
            peripheral = %self.peripheral,
            bound = self.attributes.bound_count(),
            modeled = self.attributes.len(),
            "attributes bound"
        );
    }

    fn on_value(&self, characteristic: AttributeId, value: &[u8]) {
        if self.state() == BridgeState::Idle {
            trace!(%characteristic, "value received while disconnected, ignoring");
            return;
        }
        match self.attributes.get(characteristic) {
            Some(attribute) => attribute.apply_remote_bytes(value),
            None => trace!(%characteristic, "value for unmodeled characteristic, ignoring"),
        }
    }

    fn on_write_acknowledged(&self, characteristic: AttributeId, success: bool) {
        if success || self.state() == BridgeState::Idle {
            return;
        }
        if let Some(attribute) = self.attributes.get(characteristic) {
            debug!(%characteristic, "write rejected, re-reading value");
            attribute.refresh();
        }
    }

    fn on_notify_state(&self, characteristic: AttributeId, notifying: bool) {
        if self.state() == BridgeState::Idle {
            return;
        }
        if let Some(attribute) = self.attributes.get(characteristic) {
            attribute.set_notifying(notifying);
        }
    }

    fn on_disconnected(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.cancel();
        }
        self.pending_services.clear();
        self.attributes.unbind_all();
        self.transition(BridgeState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use tokio::sync::mpsc;
    use tokio::time::advance;

    use super::*;
    use crate::attribute::{Attribute, ChangeSignal, ErasedAttribute};
    use crate::sync::{CommandReceiver, TransportCommand};

    const SERVICE: u16 = 0x180F;
    const NOTIFYING: u16 = 0x2A37;
    const POLLED: u16 = 0x2A19;

    struct Harness {
        bridge: SyncBridge,
        commands: CommandReceiver,
        notifying: Attribute<u16>,
        polled: Attribute<u8>,
        aggregate: ChangeSignal,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<CommandKind> {
            std::iter::from_fn(|| self.commands.try_recv().ok())
                .map(|command: TransportCommand| command.kind)
                .collect()
        }

        fn discover_all(&mut self) {
            let service = AttributeId::from_u16(SERVICE).uuid();
            self.bridge.handle(&PeripheralEvent::Connected);
            self.bridge.handle(&PeripheralEvent::ServicesDiscovered {
                services: vec![service],
            });
            self.bridge.handle(&PeripheralEvent::CharacteristicsDiscovered {
                service,
                characteristics: vec![
                    CharacteristicInfo::new(
                        AttributeId::from_u16(NOTIFYING),
                        CharPropFlags::READ | CharPropFlags::NOTIFY,
                    ),
                    CharacteristicInfo::new(AttributeId::from_u16(POLLED), CharPropFlags::READ),
                    CharacteristicInfo::new(AttributeId::from_u16(0x2A00), CharPropFlags::READ),
                ],
            });
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let notifying = Attribute::new(AttributeId::from_u16(NOTIFYING), 0_u16);
        let polled = Attribute::new(AttributeId::from_u16(POLLED), 100_u8);
        let aggregate = ChangeSignal::new();

        let mut attributes = AttributeMap::default();
        for attribute in [notifying.erased(), polled.erased()] {
            attribute.forward_changes_to(&aggregate);
            attributes.insert(&attribute);
        }

        let (sender, commands) = mpsc::unbounded_channel();
        Harness {
            bridge: SyncBridge::new(PeripheralId::from("AA:BB"), attributes, sender, None),
            commands,
            notifying,
            polled,
            aggregate,
        }
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn notifying_and_polled_attributes_bind(mut harness: Harness) {
        harness.discover_all();

        assert_eq!(BridgeState::Bound, harness.bridge.state());
        assert_eq!(
            vec![
                CommandKind::DiscoverServices,
                CommandKind::DiscoverCharacteristics(AttributeId::from_u16(SERVICE).uuid()),
                CommandKind::SetNotify(AttributeId::from_u16(NOTIFYING), true),
                CommandKind::Read(AttributeId::from_u16(POLLED)),
            ],
            harness.drain()
        );
        assert_eq!(2, harness.bridge.attributes().bound_count());

        assert_eq!(0, harness.notifying.read());
        assert!(harness.drain().is_empty());

        advance(Duration::from_millis(1_100)).await;
        harness.polled.read();
        advance(Duration::from_millis(300)).await;
        harness.polled.read();
        assert_eq!(
            vec![CommandKind::Read(AttributeId::from_u16(POLLED))],
            harness.drain()
        );

        let before = harness.aggregate.generation();
        harness.bridge.handle(&PeripheralEvent::ValueUpdated {
            characteristic: AttributeId::from_u16(NOTIFYING),
            value: vec![0x2C, 0x01],
        });
        assert_eq!(300, harness.notifying.read());
        assert_eq!(before + 1, harness.aggregate.generation());
    }

    #[rstest]
    fn disconnect_mid_discovery_returns_to_idle(mut harness: Harness) {
        let service = AttributeId::from_u16(SERVICE).uuid();
        harness.bridge.handle(&PeripheralEvent::Connected);
        harness.bridge.handle(&PeripheralEvent::ServicesDiscovered {
            services: vec![service],
        });
        assert_eq!(
            BridgeState::CharacteristicsDiscovering,
            harness.bridge.state()
        );

        harness.bridge.handle(&PeripheralEvent::Disconnected);
        assert_eq!(BridgeState::Idle, harness.bridge.state());

        let generation = harness.aggregate.generation();
        harness.bridge.handle(&PeripheralEvent::ValueUpdated {
            characteristic: AttributeId::from_u16(POLLED),
            value: vec![1],
        });
        assert_eq!(100, harness.polled.read());
        assert_eq!(generation, harness.aggregate.generation());

        harness.bridge.handle(&PeripheralEvent::CharacteristicsDiscovered {
            service,
            characteristics: vec![CharacteristicInfo::new(
                AttributeId::from_u16(POLLED),
                CharPropFlags::READ,
            )],
        });
        assert!(!harness.polled.is_bound());
    }

    #[rstest]
    fn unmodeled_value_update_is_ignored(mut harness: Harness) {
        harness.discover_all();
        let generation = harness.aggregate.generation();

        harness.bridge.handle(&PeripheralEvent::ValueUpdated {
            characteristic: AttributeId::from_u16(0x2A00),
            value: b"name".to_vec(),
        });

        assert_eq!(generation, harness.aggregate.generation());
    }

    #[rstest]
    fn zero_services_still_completes(mut harness: Harness) {
        harness.bridge.handle(&PeripheralEvent::Connected);
        harness
            .bridge
            .handle(&PeripheralEvent::ServicesDiscovered { services: vec![] });

        assert_eq!(BridgeState::Bound, harness.bridge.state());
        assert_eq!(0, harness.bridge.attributes().bound_count());
    }

    #[rstest]
    fn characteristics_repeated_across_services_bind_once(mut harness: Harness) {
        let battery = AttributeId::from_u16(SERVICE).uuid();
        let vendor = AttributeId::from_u16(0xFFF0).uuid();
        let characteristics = vec![
            CharacteristicInfo::new(
                AttributeId::from_u16(NOTIFYING),
                CharPropFlags::READ | CharPropFlags::NOTIFY,
            ),
            CharacteristicInfo::new(AttributeId::from_u16(POLLED), CharPropFlags::READ),
        ];
        harness.bridge.handle(&PeripheralEvent::Connected);
        harness.bridge.handle(&PeripheralEvent::ServicesDiscovered {
            services: vec![battery, vendor],
        });
        harness.drain();

        for service in [battery, vendor] {
            harness
                .bridge
                .handle(&PeripheralEvent::CharacteristicsDiscovered {
                    service,
                    characteristics: characteristics.clone(),
                });
        }

        assert_eq!(BridgeState::Bound, harness.bridge.state());
        assert_eq!(
            vec![
                CommandKind::SetNotify(AttributeId::from_u16(NOTIFYING), true),
                CommandKind::Read(AttributeId::from_u16(POLLED)),
            ],
            harness.drain()
        );
    }

    #[rstest]
    fn disconnect_unbinds_and_keeps_values(mut harness: Harness) {
        harness.discover_all();
        harness.polled.apply_remote_bytes(&[42]);

        harness.bridge.handle(&PeripheralEvent::Disconnected);

        assert_eq!(BridgeState::Idle, harness.bridge.state());
        assert_eq!(0, harness.bridge.attributes().bound_count());
        assert_eq!(42, harness.polled.read());
        assert!(!harness.notifying.is_notifying());
    }

    #[rstest]
    fn reconnect_starts_a_fresh_discovery(mut harness: Harness) {
        harness.discover_all();
        harness.bridge.handle(&PeripheralEvent::Disconnected);
        harness.drain();

        harness.bridge.handle(&PeripheralEvent::Connected);

        assert_eq!(BridgeState::ServicesDiscovering, harness.bridge.state());
        let commands: Vec<_> = std::iter::from_fn(|| harness.commands.try_recv().ok()).collect();
        assert_matches!(commands.as_slice(), [command] => {
            assert_eq!(CommandKind::DiscoverServices, command.kind);
            assert!(command.epoch.as_ref().is_some_and(|epoch| !epoch.is_cancelled()));
        });
    }

    #[rstest]
    fn rejected_write_triggers_refresh(mut harness: Harness) {
        harness.discover_all();
        harness.drain();

        harness.bridge.handle(&PeripheralEvent::WriteAcknowledged {
            characteristic: AttributeId::from_u16(POLLED),
            success: false,
        });

        assert_eq!(
            vec![CommandKind::Read(AttributeId::from_u16(POLLED))],
            harness.drain()
        );
    }

    #[rstest]
    fn failed_subscription_falls_back_to_polling(mut harness: Harness) {
        harness.discover_all();
        assert!(harness.notifying.is_notifying());
        harness.drain();

        harness.bridge.handle(&PeripheralEvent::NotifyStateChanged {
            characteristic: AttributeId::from_u16(NOTIFYING),
            notifying: false,
        });

        assert!(!harness.notifying.is_notifying());
        harness.notifying.read();
        assert_eq!(
            vec![CommandKind::Read(AttributeId::from_u16(NOTIFYING))],
            harness.drain()
        );
    }

    #[test]
    fn service_filter_limits_characteristic_discovery() {
        let wanted = AttributeId::from_u16(SERVICE).uuid();
        let ignored = AttributeId::from_u16(0x180A).uuid();
        let (sender, mut commands) = mpsc::unbounded_channel();
        let mut bridge = SyncBridge::new(
            PeripheralId::from("AA:BB"),
            AttributeMap::default(),
            sender,
            Some(vec![wanted]),
        );

        bridge.handle(&PeripheralEvent::Connected);
        bridge.handle(&PeripheralEvent::ServicesDiscovered {
            services: vec![ignored, wanted],
        });

        let issued: Vec<_> = std::iter::from_fn(|| commands.try_recv().ok())
            .map(|command| command.kind)
            .collect();
        assert_eq!(
            vec![
                CommandKind::DiscoverServices,
                CommandKind::DiscoverCharacteristics(wanted),
            ],
            issued
        );
    }
}
