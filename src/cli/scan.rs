use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bon::Builder;
use clap::Args;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{info, instrument};

use crate::cli::OutputFormat;
use crate::cli::command::parse_duration;
use crate::cli::report::{ScanReport, StopReason, StreamSummary};
use crate::discovery::{DiscoveryConfig, DiscoverySession};
use crate::hw::GattTransport;
use crate::profiles::GenericPeripheral;
use crate::terminal::TerminalClient;

use super::ui::{Painter, ScanReportView, StreamSummaryView};

/// Arguments for the `scan` command.
#[derive(Debug, Clone, Default, Args, Builder)]
pub struct ScanArgs {
    /// Stop scanning after this long (e.g. `10s`). If omitted, scan until Ctrl+C.
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,
    /// Forget disconnected peripherals not heard from for this long.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Stop after printing this many snapshots.
    #[arg(long)]
    max_snapshots: Option<usize>,
}

impl ScanArgs {
    pub(crate) fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig::builder().maybe_timeout(self.timeout).build()
    }
}

/// Executes the `scan` command.
#[instrument(skip(transport, out, terminal_client), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    transport: Arc<dyn GattTransport>,
    args: &ScanArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let session =
        DiscoverySession::<GenericPeripheral>::new(transport, args.discovery_config()).await?;
    let mut snapshots = session.start_scan().await?;
    let deadline = args.duration.map(|duration| Instant::now() + duration);

    let mut emitted = 0;
    let stop_reason = loop {
        if args.max_snapshots.is_some_and(|max| emitted >= max) {
            break StopReason::LimitReached;
        }
        let snapshot = tokio::select! {
            snapshot = snapshots.next() => snapshot,
            reason = super::stop_signal(deadline) => break reason,
        };
        let Some(snapshot) = snapshot else {
            break StopReason::Ended;
        };

        emitted += 1;
        let report = ScanReport::from_snapshot(emitted, &snapshot);
        match output_format {
            OutputFormat::Pretty => {
                writeln!(out, "{}", ScanReportView::new(&report, &painter))?;
                writeln!(out)?;
            }
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &report)?;
                writeln!(out)?;
            }
        }
    };
    session.stop_scan().await?;
    info!(emitted, %stop_reason, "scan finished");

    let summary = StreamSummary {
        emitted,
        stop_reason,
    };
    match output_format {
        OutputFormat::Pretty => {
            writeln!(
                out,
                "{}",
                StreamSummaryView::new(&summary, "snapshots", &painter)
            )?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &summary)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::discovery::DEFAULT_DISCOVERY_TIMEOUT;

    #[test]
    fn timeout_defaults_to_the_discovery_default() {
        let args = ScanArgs::default();
        assert_eq!(DEFAULT_DISCOVERY_TIMEOUT, args.discovery_config().timeout());
    }

    #[test]
    fn timeout_is_forwarded_to_discovery() {
        let args = ScanArgs::builder().timeout(Duration::from_secs(2)).build();
        assert_eq!(Duration::from_secs(2), args.discovery_config().timeout());
    }
}
