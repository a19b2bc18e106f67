use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, warn};

use crate::attribute::{
    Attribute, AttributeId, AttributeMap, AttributeValue, ChangeSignal, ErasedAttribute,
};
use crate::error::ModelError;

/// A structure declaring remote attributes, possibly through nested containers.
///
/// Implementations register every attribute field explicitly:
///
/// ```
/// use gatt_mirror::{Attribute, AttributeContainer, AttributeId, AttributeRegistry};
///
/// struct Thermometer {
///     temperature: Attribute<i16>,
///     interval: Attribute<u16>,
/// }
///
/// impl AttributeContainer for Thermometer {
///     fn register_attributes(&self, registry: &mut AttributeRegistry) {
///         registry.attribute(&self.temperature).attribute(&self.interval);
///     }
/// }
/// ```
pub trait AttributeContainer {
    /// Registers this container's attributes, recursing into nested containers.
    fn register_attributes(&self, registry: &mut AttributeRegistry);
}

/// Collects attributes in declaration order during resolution.
#[derive(Default)]
pub struct AttributeRegistry {
    entries: Vec<Arc<dyn ErasedAttribute>>,
}

impl AttributeRegistry {
    /// Registers one attribute.
    pub fn attribute<T: AttributeValue>(&mut self, attribute: &Attribute<T>) -> &mut Self {
        self.entries.push(attribute.erased());
        self
    }

    /// Registers every attribute of a nested container.
    pub fn container<C: AttributeContainer + ?Sized>(&mut self, container: &C) -> &mut Self {
        container.register_attributes(self);
        self
    }

    /// Returns how many attributes have been registered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do when two attributes of one model share an identifier.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first attribute registered and log the rest.
    #[default]
    FirstWins,
    /// Fail resolution.
    Reject,
}

/// Builds the identifier-to-attribute map of a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelResolver {
    policy: DuplicatePolicy,
}

impl ModelResolver {
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Flattens `container` into an attribute map and forwards every attribute's
    /// changes to `aggregate`.
    ///
    /// Resolution is all-or-nothing: forwarding is wired only once the whole map
    /// has been built, and repeated calls never register a forward twice.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateAttribute`] under [`DuplicatePolicy::Reject`]
    /// when two attributes share an identifier.
    pub fn resolve<C: AttributeContainer + ?Sized>(
        &self,
        container: &C,
        aggregate: &ChangeSignal,
    ) -> Result<AttributeMap, ModelError> {
        let mut registry = AttributeRegistry::default();
        container.register_attributes(&mut registry);

        let mut selected: HashMap<AttributeId, Arc<dyn ErasedAttribute>> =
            HashMap::with_capacity(registry.len());
        for attribute in registry.entries {
            let id = attribute.id();
            if selected.contains_key(&id) {
                match self.policy {
                    DuplicatePolicy::FirstWins => {
                        warn!(attribute = %id, "duplicate attribute identifier, keeping the first");
                        continue;
                    }
                    DuplicatePolicy::Reject => return Err(ModelError::DuplicateAttribute { id }),
                }
            }
            selected.insert(id, attribute);
        }

        let mut map = AttributeMap::default();
        for attribute in selected.values() {
            attribute.forward_changes_to(aggregate);
            map.insert(attribute);
        }
        debug!(attributes = map.len(), "model resolved");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    struct Battery {
        level: Attribute<u8>,
    }

    impl AttributeContainer for Battery {
        fn register_attributes(&self, registry: &mut AttributeRegistry) {
            registry.attribute(&self.level);
        }
    }

    struct Outer {
        name: Attribute<String>,
        battery: Battery,
        shadow: Attribute<u16>,
    }

    impl AttributeContainer for Outer {
        fn register_attributes(&self, registry: &mut AttributeRegistry) {
            registry
                .attribute(&self.name)
                .container(&self.battery)
                .attribute(&self.shadow);
        }
    }

    struct Empty;

    impl AttributeContainer for Empty {
        fn register_attributes(&self, _registry: &mut AttributeRegistry) {}
    }

    fn outer() -> Outer {
        Outer {
            name: Attribute::new(AttributeId::from_u16(0x2A00), String::from("lamp")),
            battery: Battery {
                level: Attribute::new(AttributeId::from_u16(0x2A19), 90),
            },
            shadow: Attribute::new(AttributeId::from_u16(0x2A19), 7),
        }
    }

    #[test]
    fn nested_containers_flatten_with_first_seen_winning() {
        let model = outer();
        let aggregate = ChangeSignal::new();

        let map = ModelResolver::default()
            .resolve(&model, &aggregate)
            .expect("first-wins resolution should succeed");

        assert_eq!(
            vec![AttributeId::from_u16(0x2A00), AttributeId::from_u16(0x2A19)],
            map.ids()
        );
        assert_eq!(Some(vec![90]), map.raw_value(AttributeId::from_u16(0x2A19)));
    }

    #[test]
    fn reject_policy_fails_without_wiring_anything() {
        let model = outer();
        let aggregate = ChangeSignal::new();

        let result = ModelResolver::new(DuplicatePolicy::Reject).resolve(&model, &aggregate);

        assert_matches!(result, Err(ModelError::DuplicateAttribute { id }) => {
            assert_eq!(AttributeId::from_u16(0x2A19), id);
        });
        model.name.set_local(String::from("desk"));
        assert_eq!(0, aggregate.generation());
    }

    #[rstest]
    #[case::once(1)]
    #[case::repeated(3)]
    fn nested_changes_reach_the_aggregate_once(#[case] resolutions: usize) {
        let model = outer();
        let aggregate = ChangeSignal::new();
        let resolver = ModelResolver::default();
        for _ in 0..resolutions {
            resolver
                .resolve(&model, &aggregate)
                .expect("resolution should succeed");
        }

        model.battery.level.apply_remote_bytes(&[55]);

        assert_eq!(1, aggregate.generation());
    }

    #[test]
    fn losing_duplicate_does_not_forward() {
        let model = outer();
        let aggregate = ChangeSignal::new();
        ModelResolver::default()
            .resolve(&model, &aggregate)
            .expect("resolution should succeed");

        model.shadow.set_local(1);

        assert_eq!(0, aggregate.generation());
    }

    #[test]
    fn containers_without_attributes_resolve_to_an_empty_map() {
        let map = ModelResolver::default()
            .resolve(&Empty, &ChangeSignal::new())
            .expect("empty models are valid");
        assert!(map.is_empty());
    }
}
