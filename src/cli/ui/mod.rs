mod device_view;
mod painter;
mod scan_view;
mod spinner;
mod table;

pub(crate) use self::device_view::{DeviceReportView, DeviceUpdateView};
pub(crate) use self::painter::Painter;
pub(crate) use self::scan_view::{ScanReportView, StreamSummaryView};
pub(crate) use self::spinner::Spinner;
