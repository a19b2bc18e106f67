use bon::Builder;
use serde::Serialize;

use crate::attribute::AttributeId;
use crate::discovery::Snapshot;
use crate::hw::PeripheralId;
use crate::model::{ConnectionState, Device};
use crate::profiles::GenericPeripheral;
use crate::sync::BridgeState;

/// Point-in-time summary of one mirrored peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Builder)]
pub(crate) struct DeviceSummary {
    #[builder(into)]
    pub(crate) id: PeripheralId,
    #[builder(into)]
    pub(crate) name: Option<String>,
    pub(crate) rssi: Option<i16>,
    pub(crate) connection: ConnectionState,
    pub(crate) bridge: BridgeState,
    pub(crate) bound_attributes: usize,
    pub(crate) battery_level: Option<u8>,
}

impl DeviceSummary {
    pub(crate) fn from_device(device: &Device<GenericPeripheral>) -> Self {
        let model = device.model();
        let battery = model.battery().battery_level();
        Self {
            id: device.id().clone(),
            name: model.name(),
            rssi: device.advertisement().rssi(),
            connection: device.state(),
            bridge: device.bridge_state(),
            bound_attributes: device.bound_count(),
            battery_level: battery.is_bound().then(|| battery.read()),
        }
    }
}

/// One emitted scan snapshot.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct ScanReport {
    pub(crate) sequence: usize,
    pub(crate) devices: Vec<DeviceSummary>,
}

impl ScanReport {
    pub(crate) fn from_snapshot(sequence: usize, snapshot: &Snapshot<GenericPeripheral>) -> Self {
        Self {
            sequence,
            devices: snapshot.iter().map(DeviceSummary::from_device).collect(),
        }
    }
}

/// Raw cached bytes of one modeled characteristic.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct AttributeReading {
    pub(crate) id: AttributeId,
    pub(crate) bound: bool,
    #[serde(with = "hex_bytes")]
    pub(crate) value: Vec<u8>,
}

/// A connected device with every modeled characteristic.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct DeviceReport {
    pub(crate) device: DeviceSummary,
    pub(crate) attributes: Vec<AttributeReading>,
}

impl DeviceReport {
    pub(crate) fn from_device(device: &Device<GenericPeripheral>) -> Self {
        let map = device.attributes();
        let attributes = map
            .ids()
            .into_iter()
            .filter_map(|id| {
                map.raw_value(id).map(|value| AttributeReading {
                    id,
                    bound: map.is_bound(id),
                    value,
                })
            })
            .collect();
        Self {
            device: DeviceSummary::from_device(device),
            attributes,
        }
    }
}

/// Why a streaming command stopped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub(crate) enum StopReason {
    /// The requested number of items was printed.
    LimitReached,
    /// The requested duration elapsed.
    Elapsed,
    /// Ctrl+C was pressed.
    Interrupted,
    /// The underlying sequence ended.
    Ended,
}

/// Trailer written once a streaming command stops.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub(crate) struct StreamSummary {
    pub(crate) emitted: usize,
    pub(crate) stop_reason: StopReason,
}

mod hex_bytes {
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn device_summary_serialises_states_in_snake_case() {
        let summary = DeviceSummary::builder()
            .id("AA:BB")
            .name("Thermo".to_string())
            .rssi(-40)
            .connection(ConnectionState::Connected)
            .bridge(BridgeState::CharacteristicsDiscovering)
            .bound_attributes(1)
            .build();

        let json = serde_json::to_value(&summary).expect("summary serialises");

        assert_eq!("connected", json["connection"]);
        assert_eq!("characteristics_discovering", json["bridge"]);
        assert_eq!(serde_json::Value::Null, json["battery_level"]);
    }

    #[test]
    fn attribute_readings_encode_values_as_hex() {
        let reading = AttributeReading {
            id: AttributeId::from_u16(0x2A19),
            bound: true,
            value: vec![0x64],
        };

        let json = serde_json::to_value(&reading).expect("reading serialises");

        assert_eq!("00002a19-0000-1000-8000-00805f9b34fb", json["id"]);
        assert_eq!("64", json["value"]);
    }
}
