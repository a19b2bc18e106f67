use std::time::Duration;

use bon::Builder;
use uuid::Uuid;

use crate::model::DuplicatePolicy;

/// Default age after which a disconnected, silent peripheral is dropped.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_PRUNE_INTERVAL: Duration = Duration::from_millis(10);

/// Settings for a [`DiscoverySession`](super::DiscoverySession).
#[derive(Debug, Clone, Builder)]
pub struct DiscoveryConfig {
    /// Maximum age of the last advertisement of a disconnected device.
    #[builder(default = DEFAULT_DISCOVERY_TIMEOUT)]
    timeout: Duration,
    /// How often stale devices are pruned while no advertisements arrive.
    prune_interval: Option<Duration>,
    /// Overrides the model's advertised-service scan filter.
    service_filter: Option<Vec<Uuid>>,
    #[builder(default)]
    duplicate_policy: DuplicatePolicy,
}

impl DiscoveryConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the prune period, half the timeout unless set explicitly.
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        self.prune_interval
            .unwrap_or(self.timeout / 2)
            .max(MIN_PRUNE_INTERVAL)
    }

    #[must_use]
    pub fn service_filter(&self) -> Option<&[Uuid]> {
        self.service_filter.as_deref()
    }

    #[must_use]
    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.duplicate_policy
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = DiscoveryConfig::default();

        assert_eq!(Duration::from_secs(5), config.timeout());
        assert_eq!(Duration::from_millis(2_500), config.prune_interval());
        assert_eq!(None, config.service_filter());
        assert_eq!(DuplicatePolicy::FirstWins, config.duplicate_policy());
    }

    #[rstest]
    #[case(Duration::ZERO, None, MIN_PRUNE_INTERVAL)]
    #[case(Duration::from_secs(10), Some(Duration::from_secs(1)), Duration::from_secs(1))]
    #[case(Duration::from_secs(2), None, Duration::from_secs(1))]
    fn prune_interval_is_derived_and_clamped(
        #[case] timeout: Duration,
        #[case] explicit: Option<Duration>,
        #[case] expected: Duration,
    ) {
        let config = DiscoveryConfig::builder()
            .timeout(timeout)
            .maybe_prune_interval(explicit)
            .build();
        assert_eq!(expected, config.prune_interval());
    }
}
