use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::signal::ChangeSignal;
use super::AttributeId;
use crate::sync::Binding;

/// Type-erased view of an attribute used by the synchronization bridge.
pub(crate) trait ErasedAttribute: Send + Sync {
    fn id(&self) -> AttributeId;
    fn apply_remote_bytes(&self, data: &[u8]);
    fn mark_discovered(&self, binding: Binding, notifying: bool);
    fn set_notifying(&self, notifying: bool);
    fn unbind(&self);
    fn is_bound(&self) -> bool;
    fn refresh(&self);
    fn raw_value(&self) -> Vec<u8>;
    /// Registers `target` to be notified on every change; `false` if already registered.
    fn forward_changes_to(&self, target: &ChangeSignal) -> bool;
    fn value_type(&self) -> &'static str;
}

/// Characteristic identifier to attribute lookup for one device model.
///
/// Entries are non-owning: the model keeps its attributes alive, and an entry
/// whose attribute has been dropped simply stops resolving.
#[derive(Default, Clone)]
pub struct AttributeMap {
    entries: HashMap<AttributeId, Weak<dyn ErasedAttribute>>,
}

impl AttributeMap {
    pub(crate) fn insert(&mut self, attribute: &Arc<dyn ErasedAttribute>) {
        self.entries.insert(attribute.id(), Arc::downgrade(attribute));
    }

    pub(crate) fn get(&self, id: AttributeId) -> Option<Arc<dyn ErasedAttribute>> {
        self.entries.get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = Arc<dyn ErasedAttribute>> + '_ {
        self.entries.values().filter_map(Weak::upgrade)
    }

    /// Returns the number of mapped characteristics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: AttributeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns the mapped identifiers in a stable order.
    #[must_use]
    pub fn ids(&self) -> Vec<AttributeId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns how many mapped attributes are bound to a live characteristic.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.live().filter(|attribute| attribute.is_bound()).count()
    }

    /// Returns whether one attribute is bound; `false` for unknown identifiers.
    #[must_use]
    pub fn is_bound(&self, id: AttributeId) -> bool {
        self.get(id).is_some_and(|attribute| attribute.is_bound())
    }

    /// Returns the encoded cached value of one attribute.
    #[must_use]
    pub fn raw_value(&self, id: AttributeId) -> Option<Vec<u8>> {
        self.get(id).map(|attribute| attribute.raw_value())
    }

    /// Requests a fresh read of every bound attribute, notifying ones included.
    ///
    /// Returns how many reads were requested.
    pub fn refresh_all(&self) -> usize {
        self.live()
            .filter(|attribute| attribute.is_bound())
            .inspect(|attribute| attribute.refresh())
            .count()
    }

    pub(crate) fn unbind_all(&self) {
        for attribute in self.live() {
            attribute.unbind();
        }
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for id in self.ids() {
            let value_type = self
                .get(id)
                .map_or("<dropped>", |attribute| attribute.value_type());
            map.entry(&id, &value_type);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::attribute::Attribute;

    #[test]
    fn entries_do_not_keep_attributes_alive() {
        let attribute = Attribute::new(AttributeId::from_u16(0x2A19), 0_u8);
        let mut map = AttributeMap::default();
        map.insert(&attribute.erased());

        assert!(map.get(attribute.id()).is_some());
        assert_eq!(Some(vec![0]), map.raw_value(attribute.id()));

        let id = attribute.id();
        drop(attribute);

        assert!(map.contains(id));
        assert!(map.get(id).is_none());
        assert_eq!(0, map.live().count());
    }

    #[test]
    fn unbound_attributes_are_not_refreshed() {
        let attribute = Attribute::new(AttributeId::from_u16(0x2A19), 0_u8);
        let mut map = AttributeMap::default();
        map.insert(&attribute.erased());

        assert!(!map.is_bound(attribute.id()));
        assert_eq!(0, map.refresh_all());
    }
}
