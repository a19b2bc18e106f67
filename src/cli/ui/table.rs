use tabled::{builder::Builder, settings::Style};

use crate::cli::report::{AttributeReading, DeviceSummary};
use crate::utils::{format_hex, format_rssi};

use super::painter::Painter;

const UNKNOWN_NAME: &str = "<unknown>";

/// One row per device: identity, name, signal and link state.
pub(super) fn device_grid(painter: &Painter, devices: &[DeviceSummary]) -> String {
    let rows = devices.iter().map(|device| {
        [
            device.id.to_string(),
            device.name.as_deref().unwrap_or(UNKNOWN_NAME).to_string(),
            format_rssi(device.rssi),
            painter.connection(device.connection),
        ]
    });
    rounded(["id", "name", "rssi", "connection"], rows)
}

/// Every field of one device, with muted field names.
pub(super) fn device_fields(painter: &Painter, device: &DeviceSummary) -> String {
    let battery = device
        .battery_level
        .map_or_else(|| painter.muted("-"), |level| painter.value(format!("{level}%")));
    let fields = [
        ("id", painter.value(device.id.as_str())),
        (
            "name",
            painter.value(device.name.as_deref().unwrap_or(UNKNOWN_NAME)),
        ),
        ("rssi", painter.value(format_rssi(device.rssi))),
        ("connection", painter.connection(device.connection)),
        ("bridge", painter.bridge(device.bridge)),
        ("bound", painter.value(device.bound_attributes.to_string())),
        ("battery", battery),
    ];
    rounded(
        ["field", "value"],
        fields
            .into_iter()
            .map(|(field, value)| [painter.muted(field), value]),
    )
}

/// Cached bytes of each modeled characteristic and whether it is bound.
pub(super) fn attribute_grid(painter: &Painter, readings: &[AttributeReading]) -> String {
    let rows = readings.iter().map(|reading| {
        let state = if reading.bound {
            painter.success("bound")
        } else {
            painter.warning("unbound")
        };
        [reading.id.to_string(), state, format_hex(&reading.value)]
    });
    rounded(["characteristic", "state", "value"], rows)
}

fn rounded<const N: usize>(
    header: [&str; N],
    rows: impl IntoIterator<Item = [String; N]>,
) -> String {
    let mut builder = Builder::default();
    builder.push_record(header.map(String::from));
    for row in rows {
        builder.push_record(row);
    }
    builder.build().with(Style::rounded()).to_string()
}
