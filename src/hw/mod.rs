mod btleplug_backend;
mod fake_backend;
mod transport;

pub use self::btleplug_backend::BtleplugTransport;
pub use self::fake_backend::{
    FakeCharacteristic, FakePeripheral, FakePeripherals, FakeService, FakeTransport,
    ResponseMode, TransportCall,
};
pub use self::transport::{
    Advertisement, CharacteristicInfo, EventStream, GattTransport, PeripheralEvent, PeripheralId,
    TransportEvent,
};
