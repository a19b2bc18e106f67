use thiserror::Error;

use crate::attribute::AttributeId;
use crate::hw::PeripheralId;

/// Errors returned by GATT transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{peripheral}` is not known to the transport")]
    UnknownPeripheral { peripheral: PeripheralId },
    #[error("peripheral `{peripheral}` is not connected")]
    NotConnected { peripheral: PeripheralId },
    #[error("characteristic `{characteristic}` was not found on peripheral `{peripheral}`")]
    UnknownCharacteristic {
        peripheral: PeripheralId,
        characteristic: AttributeId,
    },
    #[error("service `{service}` was not found on peripheral `{peripheral}`")]
    UnknownService {
        peripheral: PeripheralId,
        service: uuid::Uuid,
    },
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// Errors returned when decoding raw characteristic bytes into a typed value.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CodecError {
    #[error("expected {expected} bytes for `{type_name}`, received {actual}")]
    WrongWidth {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Errors returned while resolving a device model's attribute map.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ModelError {
    #[error("attribute `{id}` is declared more than once in the device model")]
    DuplicateAttribute { id: AttributeId },
}

/// Errors returned by the discovery session.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("a scan is already active on this discovery session")]
    AlreadyScanning,
    #[error("the discovery session has been shut down")]
    SessionClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors returned when parsing fake transport fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake peripheral fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain three or four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid hex payload `{value}`")]
    InvalidHex {
        value: String,
        source: hex::FromHexError,
    },
    #[error("invalid UUID `{value}`")]
    InvalidUuid { value: String, source: uuid::Error },
}

/// Errors returned by the `connect` command.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no peripheral named `{prefix}*` was found within {waited}")]
    NoMatchingPeripheral { prefix: String, waited: String },
    #[error("scanning stopped before a peripheral named `{prefix}*` was found")]
    ScanEnded { prefix: String },
    #[error("peripheral `{peripheral}` was not bound within {waited}")]
    BindTimeout {
        peripheral: PeripheralId,
        waited: String,
    },
    #[error("peripheral `{peripheral}` disconnected before it was bound")]
    ConnectionLost { peripheral: PeripheralId },
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake peripheral fixture while fake mode is enabled")]
    MissingFakePeripherals,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
