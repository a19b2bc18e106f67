mod app;
mod attribute;
mod cli;
mod codec;
mod discovery;
mod error;
mod hw;
mod model;
pub mod profiles;
mod sync;
mod telemetry;
mod terminal;
mod utils;

pub use app::{fake_transport, real_transport, run, run_with_clients};
pub use attribute::{
    Attribute, AttributeId, AttributeMap, AttributeValue, ChangeReceiver, ChangeSignal,
    DEFAULT_POLLING_INTERVAL,
};
pub use cli::{Args, Command, ConnectArgs, FakeArgs, LogLevel, OutputFormat, ScanArgs};
pub use codec::AttributeCodec;
pub use discovery::{
    DEFAULT_DISCOVERY_TIMEOUT, DiscoveryConfig, DiscoverySession, Snapshot, SnapshotStream,
};
pub use error::{
    CodecError, ConnectError, DiscoveryError, FixtureError, ModelError, TransportError,
};
pub use hw::{
    Advertisement, BtleplugTransport, CharacteristicInfo, EventStream, FakeCharacteristic,
    FakePeripheral, FakePeripherals, FakeService, FakeTransport, GattTransport, PeripheralEvent,
    PeripheralId, ResponseMode, TransportCall, TransportEvent,
};
pub use model::{
    AttributeContainer, AttributeRegistry, ConnectionState, Device, DeviceModel, DuplicatePolicy,
    ModelResolver,
};
pub use sync::BridgeState;
pub use terminal::{SystemTerminalClient, TerminalClient};
