mod config;
mod session;
mod snapshot;

pub use self::config::{DEFAULT_DISCOVERY_TIMEOUT, DiscoveryConfig};
pub use self::session::DiscoverySession;
pub use self::snapshot::{Snapshot, SnapshotStream};
