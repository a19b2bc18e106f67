use std::fmt::{self, Display, Formatter};

use crate::cli::report::{ScanReport, StreamSummary};

use super::painter::Painter;
use super::table;

/// Renders one scan snapshot as a device grid.
pub(crate) struct ScanReportView<'a> {
    report: &'a ScanReport,
    painter: &'a Painter,
}

impl<'a> ScanReportView<'a> {
    pub(crate) fn new(report: &'a ScanReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for ScanReportView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        let heading = painter.heading(format!(
            "Snapshot #{} ({} devices):",
            self.report.sequence,
            self.report.devices.len()
        ));
        if self.report.devices.is_empty() {
            return write!(f, "{heading}\n{}", painter.muted("no devices in range"));
        }

        let devices = table::device_grid(painter, &self.report.devices);
        write!(f, "{heading}\n{devices}")
    }
}

/// Renders the trailer of a streaming command.
pub(crate) struct StreamSummaryView<'a> {
    summary: &'a StreamSummary,
    noun: &'a str,
    painter: &'a Painter,
}

impl<'a> StreamSummaryView<'a> {
    pub(crate) fn new(summary: &'a StreamSummary, noun: &'a str, painter: &'a Painter) -> Self {
        Self {
            summary,
            noun,
            painter,
        }
    }
}

impl Display for StreamSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.painter.success("✓"),
            self.painter.value(self.summary.emitted.to_string()),
            self.noun,
            self.painter
                .muted(format!("(stopped: {})", self.summary.stop_reason))
        )
    }
}
