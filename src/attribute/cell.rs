use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::map::ErasedAttribute;
use super::signal::{ChangeReceiver, ChangeSignal};
use super::AttributeId;
use crate::codec::AttributeCodec;
use crate::sync::{Binding, CommandKind};

/// Default maximum age of a polled value before a read triggers a refresh.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Types that can be mirrored by an [`Attribute`].
pub trait AttributeValue: AttributeCodec + Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> AttributeValue for T where T: AttributeCodec + Clone + PartialEq + Debug + Send + Sync + 'static
{}

/// A typed, observable mirror of one remote characteristic.
///
/// An attribute is created together with its device model, before any
/// connection exists, and holds `initial` until the peripheral reports a value.
/// Reads never block: a stale polled value is returned immediately while a
/// refresh is requested in the background.
///
/// ```
/// use gatt_mirror::{Attribute, AttributeId};
///
/// let battery_level = Attribute::new(AttributeId::from_u16(0x2A19), 0_u8);
/// assert_eq!(0, battery_level.read());
/// assert!(!battery_level.is_bound());
/// ```
pub struct Attribute<T> {
    cell: Arc<AttributeCell<T>>,
}

impl<T: AttributeValue> Attribute<T> {
    /// Declares an attribute with a default value.
    #[must_use]
    pub fn new(id: AttributeId, initial: T) -> Self {
        Self {
            cell: Arc::new(AttributeCell {
                id,
                state: Mutex::new(CellState {
                    value: initial,
                    polling_interval: DEFAULT_POLLING_INTERVAL,
                    last_refresh: None,
                    notifying: false,
                    binding: None,
                }),
                signal: ChangeSignal::new(),
                forwards: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Overrides the maximum age of a polled value.
    #[must_use]
    pub fn with_polling_interval(self, interval: Duration) -> Self {
        self.cell.lock().polling_interval = interval;
        self
    }

    /// Returns the characteristic identifier.
    #[must_use]
    pub fn id(&self) -> AttributeId {
        self.cell.id
    }

    /// Returns the cached value, requesting a refresh if it is stale.
    pub fn read(&self) -> T {
        self.cell.read()
    }

    /// Writes a new value to the peripheral, updating the cache optimistically.
    ///
    /// Writing the value already cached issues no radio traffic.
    pub fn write(&self, value: T) {
        self.cell.write(value);
    }

    /// Replaces the cached value without contacting the peripheral.
    pub fn set_local(&self, value: T) {
        self.cell.store(value);
    }

    /// Requests a fresh value regardless of the polling interval.
    pub fn refresh(&self) {
        ErasedAttribute::refresh(&*self.cell);
    }

    /// Decodes and stores a raw payload received from the peripheral.
    ///
    /// Undecodable payloads are logged and leave the cache untouched.
    pub fn apply_remote_bytes(&self, data: &[u8]) {
        ErasedAttribute::apply_remote_bytes(&*self.cell, data);
    }

    /// Returns whether the attribute is bound to a live remote characteristic.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        ErasedAttribute::is_bound(&*self.cell)
    }

    /// Returns whether the peripheral pushes updates for this attribute.
    #[must_use]
    pub fn is_notifying(&self) -> bool {
        self.cell.lock().notifying
    }

    /// Returns the configured polling interval.
    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        self.cell.lock().polling_interval
    }

    /// Subscribes to changes of this attribute only.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        self.cell.signal.subscribe()
    }

    pub(crate) fn erased(&self) -> Arc<dyn ErasedAttribute> {
        self.cell.clone()
    }
}

impl<T> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Debug> Debug for Attribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Attribute")
            .field("id", &self.cell.id)
            .field("value", &state.value)
            .field("notifying", &state.notifying)
            .field("bound", &state.binding.is_some())
            .finish()
    }
}

struct AttributeCell<T> {
    id: AttributeId,
    state: Mutex<CellState<T>>,
    signal: ChangeSignal,
    forwards: Mutex<Vec<ChangeSignal>>,
}

struct CellState<T> {
    value: T,
    polling_interval: Duration,
    last_refresh: Option<Instant>,
    notifying: bool,
    binding: Option<Binding>,
}

impl<T> CellState<T> {
    fn live_binding(&self) -> Option<&Binding> {
        self.binding.as_ref().filter(|binding| binding.is_live())
    }

    fn is_stale(&self, now: Instant) -> bool {
        if self.notifying {
            return false;
        }
        self.last_refresh
            .is_none_or(|last| now.duration_since(last) > self.polling_interval)
    }
}

impl<T: AttributeValue> AttributeCell<T> {
    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> T {
        let now = Instant::now();
        let mut state = self.lock();
        if state.is_stale(now) {
            match state.live_binding() {
                Some(binding) => {
                    trace!(attribute = %self.id, "value is stale, requesting refresh");
                    binding.issue(CommandKind::Read(self.id));
                    state.last_refresh = Some(now);
                }
                None => trace!(attribute = %self.id, "stale value is unbound, skipping refresh"),
            }
        }
        state.value.clone()
    }

    fn write(&self, value: T) {
        {
            let mut state = self.lock();
            if state.value == value {
                trace!(attribute = %self.id, "write matches cached value, skipping");
                return;
            }
            let Some(binding) = state.live_binding() else {
                warn!(attribute = %self.id, "write attempted before the attribute was bound");
                return;
            };

            debug!(attribute = %self.id, ?value, "write request");
            binding.issue(CommandKind::Write(self.id, value.encode()));
            state.value = value;
        }
        self.emit_change();
    }

    fn store(&self, value: T) {
        {
            let mut state = self.lock();
            trace!(attribute = %self.id, ?value, "local value set");
            state.value = value;
        }
        self.emit_change();
    }

    fn emit_change(&self) {
        self.signal.notify();
        let forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
        for target in forwards.iter() {
            target.notify();
        }
    }
}

impl<T: AttributeValue> ErasedAttribute for AttributeCell<T> {
    fn id(&self) -> AttributeId {
        self.id
    }

    fn apply_remote_bytes(&self, data: &[u8]) {
        match T::decode(data) {
            Ok(value) => self.store(value),
            Err(error) => warn!(
                attribute = %self.id,
                payload_len = data.len(),
                %error,
                "discarding undecodable payload"
            ),
        }
    }

    fn mark_discovered(&self, binding: Binding, notifying: bool) {
        let mut state = self.lock();
        state.notifying = notifying;
        if !notifying {
            binding.issue(CommandKind::Read(self.id));
            state.last_refresh = Some(Instant::now());
        }
        state.binding = Some(binding);
    }

    fn set_notifying(&self, notifying: bool) {
        let mut state = self.lock();
        if state.notifying != notifying {
            debug!(attribute = %self.id, notifying, "notification state changed");
            state.notifying = notifying;
        }
    }

    fn unbind(&self) {
        let mut state = self.lock();
        state.binding = None;
        state.notifying = false;
        state.last_refresh = None;
    }

    fn is_bound(&self) -> bool {
        self.lock().live_binding().is_some()
    }

    fn refresh(&self) {
        let mut state = self.lock();
        let Some(binding) = state.live_binding() else {
            debug!(attribute = %self.id, "refresh attempted before the attribute was bound");
            return;
        };
        binding.issue(CommandKind::Read(self.id));
        state.last_refresh = Some(Instant::now());
    }

    fn raw_value(&self) -> Vec<u8> {
        self.lock().value.encode()
    }

    fn forward_changes_to(&self, target: &ChangeSignal) -> bool {
        let mut forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
        if forwards.iter().any(|existing| existing.same_channel(target)) {
            return false;
        }
        forwards.push(target.clone());
        true
    }

    fn value_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    use super::*;
    use crate::hw::PeripheralId;
    use crate::sync::{CommandReceiver, TransportCommand};

    const LEVEL: u16 = 0x2A19;

    fn bound_attribute(notifying: bool) -> (Attribute<u8>, Binding, CommandReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let binding = Binding::new(PeripheralId::from("AA:BB"), sender);
        let attribute = Attribute::new(AttributeId::from_u16(LEVEL), 0_u8);
        attribute.cell.mark_discovered(binding.clone(), notifying);
        (attribute, binding, receiver)
    }

    fn drain(receiver: &mut CommandReceiver) -> Vec<CommandKind> {
        std::iter::from_fn(|| receiver.try_recv().ok())
            .map(|command: TransportCommand| command.kind)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn polled_reads_refresh_at_most_once_per_interval() {
        let (attribute, _binding, mut commands) = bound_attribute(false);
        let id = attribute.id();
        assert_eq!(vec![CommandKind::Read(id)], drain(&mut commands));

        for _ in 0..5 {
            attribute.read();
        }
        assert!(drain(&mut commands).is_empty());

        advance(Duration::from_millis(1_100)).await;
        attribute.read();
        advance(Duration::from_millis(400)).await;
        attribute.read();
        assert_eq!(vec![CommandKind::Read(id)], drain(&mut commands));
    }

    #[tokio::test(start_paused = true)]
    async fn notifying_reads_never_refresh() {
        let (attribute, _binding, mut commands) = bound_attribute(true);

        assert_eq!(0, attribute.read());
        advance(Duration::from_secs(60)).await;
        assert_eq!(0, attribute.read());
        assert!(drain(&mut commands).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_polling_interval_is_honoured() {
        let (sender, mut commands) = mpsc::unbounded_channel();
        let binding = Binding::new(PeripheralId::from("AA:BB"), sender);
        let attribute = Attribute::new(AttributeId::from_u16(LEVEL), 0_u8)
            .with_polling_interval(Duration::from_secs(10));
        attribute.cell.mark_discovered(binding, false);
        drain(&mut commands);

        advance(Duration::from_secs(5)).await;
        attribute.read();
        assert!(drain(&mut commands).is_empty());

        advance(Duration::from_secs(6)).await;
        attribute.read();
        assert_eq!(1, drain(&mut commands).len());
    }

    #[test]
    fn unbound_reads_and_writes_issue_nothing() {
        let attribute = Attribute::new(AttributeId::from_u16(LEVEL), 7_u8);
        let changes = attribute.subscribe();

        assert_eq!(7, attribute.read());
        attribute.write(9);
        attribute.refresh();

        assert_eq!(7, attribute.read());
        assert!(!changes.has_changed());
    }

    #[test]
    fn writing_the_cached_value_is_a_no_op() {
        let (attribute, _binding, mut commands) = bound_attribute(true);
        let changes = attribute.subscribe();

        attribute.write(0);

        assert!(drain(&mut commands).is_empty());
        assert!(!changes.has_changed());
    }

    #[test]
    fn writes_update_optimistically_and_encode_the_payload() {
        let (attribute, _binding, mut commands) = bound_attribute(true);
        let changes = attribute.subscribe();

        attribute.write(42);

        assert_eq!(42, attribute.read());
        assert_eq!(
            vec![CommandKind::Write(attribute.id(), vec![42])],
            drain(&mut commands)
        );
        assert!(changes.has_changed());
    }

    #[test]
    fn wrong_width_payload_leaves_cache_untouched() {
        let attribute = Attribute::new(AttributeId::from_u16(0x2A37), 0x0102_u16);
        let changes = attribute.subscribe();

        attribute.apply_remote_bytes(&[0x01, 0x02, 0x03]);
        attribute.apply_remote_bytes(&[]);

        assert_eq!(0x0102, attribute.read());
        assert!(!changes.has_changed());
    }

    #[test]
    fn remote_bytes_replace_cache_and_signal_once() {
        let attribute = Attribute::new(AttributeId::from_u16(0x2A37), 0_u16);
        let changes = attribute.subscribe();

        attribute.apply_remote_bytes(&[0x34, 0x12]);

        assert_eq!(0x1234, attribute.read());
        assert_eq!(1, changes.generation());
    }

    #[test]
    fn unbind_keeps_last_value_and_stops_refreshing() {
        let (attribute, binding, mut commands) = bound_attribute(false);
        attribute.apply_remote_bytes(&[55]);
        drain(&mut commands);

        binding.cancel();
        attribute.cell.unbind();

        assert!(!attribute.is_bound());
        assert_eq!(55, attribute.read());
        attribute.refresh();
        assert!(drain(&mut commands).is_empty());
    }

    #[test]
    fn forwarding_is_registered_once_per_target() {
        let attribute = Attribute::new(AttributeId::from_u16(LEVEL), 0_u8);
        let aggregate = ChangeSignal::new();

        assert!(attribute.cell.forward_changes_to(&aggregate));
        assert!(!attribute.cell.forward_changes_to(&aggregate.clone()));

        attribute.set_local(3);
        assert_eq!(1, aggregate.generation());
    }
}
