use std::fmt::{self, Display, Formatter};

use crate::cli::report::{DeviceReport, DeviceSummary};

use super::painter::Painter;
use super::table;

/// Renders a [`DeviceSummary`] as a key-value table.
pub(crate) struct DeviceView<'a> {
    device: &'a DeviceSummary,
    painter: &'a Painter,
}

impl<'a> DeviceView<'a> {
    pub(crate) fn new(device: &'a DeviceSummary, painter: &'a Painter) -> Self {
        Self { device, painter }
    }
}

impl Display for DeviceView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", table::device_fields(self.painter, self.device))
    }
}

/// Renders a connected device followed by its attribute cache.
pub(crate) struct DeviceReportView<'a> {
    report: &'a DeviceReport,
    painter: &'a Painter,
}

impl<'a> DeviceReportView<'a> {
    pub(crate) fn new(report: &'a DeviceReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for DeviceReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        let attributes = table::attribute_grid(painter, &self.report.attributes);

        write!(f, "{}", painter.heading("Connected device:"))?;
        write!(f, "\n{}", DeviceView::new(&self.report.device, painter))?;
        writeln!(f)?;
        write!(f, "\n{}", painter.heading("Attributes:"))?;
        write!(f, "\n{attributes}")
    }
}

/// Renders one model change as a single line.
pub(crate) struct DeviceUpdateView<'a> {
    sequence: usize,
    device: &'a DeviceSummary,
    painter: &'a Painter,
}

impl<'a> DeviceUpdateView<'a> {
    pub(crate) fn new(sequence: usize, device: &'a DeviceSummary, painter: &'a Painter) -> Self {
        Self {
            sequence,
            device,
            painter,
        }
    }
}

impl Display for DeviceUpdateView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        let battery = self
            .device
            .battery_level
            .map_or_else(|| "-".to_string(), |level| format!("{level}%"));
        write!(
            f,
            "{} {} {} {} battery={}",
            painter.muted(format!("#{}", self.sequence)),
            painter.value(self.device.id.as_str()),
            self.device.name.as_deref().unwrap_or("<unknown>"),
            painter.connection(self.device.connection),
            painter.value(battery)
        )
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::attribute::AttributeId;
    use crate::cli::report::AttributeReading;
    use crate::model::ConnectionState;
    use crate::sync::BridgeState;

    fn summary(name: Option<&str>, battery_level: Option<u8>) -> DeviceSummary {
        DeviceSummary::builder()
            .id("AA:BB")
            .maybe_name(name)
            .rssi(-43)
            .connection(ConnectionState::Connected)
            .bridge(BridgeState::Bound)
            .bound_attributes(2)
            .maybe_battery_level(battery_level)
            .build()
    }

    #[rstest]
    #[case::all_fields(Some("Thermo"), Some(100), "device_all_fields")]
    #[case::missing_name(None, Some(100), "device_missing_name")]
    #[case::missing_battery(Some("Thermo"), None, "device_missing_battery")]
    fn device_view_renders(
        #[case] name: Option<&str>,
        #[case] battery_level: Option<u8>,
        #[case] snapshot_name: &str,
    ) {
        let device = summary(name, battery_level);
        let painter = Painter::new(false);
        assert_snapshot!(snapshot_name, DeviceView::new(&device, &painter).to_string());
    }

    #[test]
    fn update_view_is_a_single_line() {
        let device = summary(Some("Thermo"), Some(97));
        let painter = Painter::new(false);
        assert_eq!(
            "#4 AA:BB Thermo connected battery=97%",
            DeviceUpdateView::new(4, &device, &painter).to_string()
        );
    }

    #[test]
    fn report_view_lists_attributes() {
        let report = DeviceReport {
            device: summary(Some("Thermo"), Some(100)),
            attributes: vec![
                AttributeReading {
                    id: AttributeId::from_u16(0x2A19),
                    bound: true,
                    value: vec![0x64],
                },
                AttributeReading {
                    id: AttributeId::from_u16(0x2A29),
                    bound: false,
                    value: Vec::new(),
                },
            ],
        };
        let painter = Painter::new(false);
        assert_snapshot!(
            "device_report",
            DeviceReportView::new(&report, &painter).to_string()
        );
    }
}
