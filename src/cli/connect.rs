use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bon::Builder;
use clap::Args;
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument};

use crate::cli::OutputFormat;
use crate::cli::command::parse_duration;
use crate::cli::report::{DeviceReport, DeviceSummary, StopReason, StreamSummary};
use crate::discovery::{DiscoveryConfig, DiscoverySession, SnapshotStream};
use crate::error::ConnectError;
use crate::hw::GattTransport;
use crate::model::{ConnectionState, Device};
use crate::profiles::GenericPeripheral;
use crate::sync::BridgeState;
use crate::terminal::TerminalClient;

use super::ui::{DeviceReportView, DeviceUpdateView, Painter, Spinner, StreamSummaryView};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read responses issued during binding are considered settled after this much quiet.
const SETTLE_WINDOW: Duration = Duration::from_millis(200);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Arguments for the `connect` command.
#[derive(Debug, Clone, Args, Builder)]
pub struct ConnectArgs {
    /// Connect to the first peripheral whose name starts with this prefix.
    #[arg(long)]
    #[builder(into)]
    name_prefix: String,
    /// Maximum time to find, connect and bind the peripheral.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Keep printing model changes after binding, until Ctrl+C or a limit.
    #[arg(long)]
    #[builder(default)]
    watch: bool,
    /// Stop watching after this long.
    #[arg(long, requires = "watch", value_parser = parse_duration)]
    duration: Option<Duration>,
    /// Stop watching after this many changes.
    #[arg(long, requires = "watch")]
    max_updates: Option<usize>,
}

impl ConnectArgs {
    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }
}

/// Executes the `connect` command.
#[instrument(
    skip(transport, args, out, terminal_client),
    level = "info",
    fields(name_prefix = %args.name_prefix, ?output_format)
)]
pub(crate) async fn run<W>(
    transport: Arc<dyn GattTransport>,
    args: &ConnectArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let spinner = Spinner::new(terminal_client.stderr_is_terminal());
    let deadline = Instant::now() + args.timeout();

    let session =
        DiscoverySession::<GenericPeripheral>::new(transport, DiscoveryConfig::default()).await?;
    let snapshots = session.start_scan().await?;
    let found = spinner
        .wrap(
            format!("Scanning for `{}*`", args.name_prefix),
            time::timeout_at(deadline, find_device(snapshots, &args.name_prefix)),
        )
        .await;
    session.stop_scan().await?;
    let device = match found {
        Ok(device) => device?,
        Err(_elapsed) => {
            return Err(ConnectError::NoMatchingPeripheral {
                prefix: args.name_prefix.clone(),
                waited: humantime::format_duration(args.timeout()).to_string(),
            }
            .into());
        }
    };
    info!(peripheral = %device.id(), "peripheral found");

    let bound = spinner
        .wrap(
            format!("Connecting to {}", device.id()),
            bind(&device, deadline, args.timeout()),
        )
        .await;
    if let Err(error) = bound {
        disconnect(&device).await;
        return Err(error.into());
    }
    let requested = device.attributes().refresh_all();
    debug!(requested, "requested an initial read of every bound attribute");
    settle(&device, deadline).await;

    let report = DeviceReport::from_device(&device);
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out, "{}", DeviceReportView::new(&report, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &report)?;
            writeln!(out)?;
        }
    }

    if args.watch {
        let summary = watch(&device, args, out, &painter, output_format).await?;
        match output_format {
            OutputFormat::Pretty => {
                writeln!(out)?;
                writeln!(
                    out,
                    "{}",
                    StreamSummaryView::new(&summary, "updates", &painter)
                )?;
            }
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &summary)?;
                writeln!(out)?;
            }
        }
    }

    disconnect(&device).await;
    Ok(())
}

async fn find_device(
    mut snapshots: SnapshotStream<GenericPeripheral>,
    name_prefix: &str,
) -> Result<Device<GenericPeripheral>, ConnectError> {
    while let Some(snapshot) = snapshots.next().await {
        let matching = snapshot.iter().find(|device| {
            device
                .model()
                .name()
                .is_some_and(|name| name.starts_with(name_prefix))
        });
        if let Some(device) = matching {
            return Ok(device.clone());
        }
    }
    Err(ConnectError::ScanEnded {
        prefix: name_prefix.to_string(),
    })
}

/// Connects and waits until every discovered characteristic is bound.
async fn bind(
    device: &Device<GenericPeripheral>,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), ConnectError> {
    let mut bridge = device.watch_bridge_state();
    let mut connection = device.watch_state();
    device.connect();

    let outcome = time::timeout_at(deadline, async {
        loop {
            if *bridge.borrow_and_update() == BridgeState::Bound {
                return Ok(());
            }
            tokio::select! {
                changed = bridge.changed() => {
                    if changed.is_err() {
                        return Err(lost(device));
                    }
                }
                changed = connection.changed() => {
                    let disconnected =
                        *connection.borrow_and_update() == ConnectionState::Disconnected;
                    if changed.is_err() || disconnected {
                        return Err(lost(device));
                    }
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_elapsed) => Err(ConnectError::BindTimeout {
            peripheral: device.id().clone(),
            waited: humantime::format_duration(timeout).to_string(),
        }),
    }
}

fn lost(device: &Device<GenericPeripheral>) -> ConnectError {
    ConnectError::ConnectionLost {
        peripheral: device.id().clone(),
    }
}

/// Waits until the device has been quiet for [`SETTLE_WINDOW`] or `deadline` passes.
async fn settle(device: &Device<GenericPeripheral>, deadline: Instant) {
    let mut changes = device.subscribe();
    loop {
        let quiet_until = (Instant::now() + SETTLE_WINDOW).min(deadline);
        match time::timeout_at(quiet_until, changes.changed()).await {
            Ok(Some(generation)) => debug!(generation, "binding still settling"),
            Ok(None) | Err(_) => return,
        }
    }
}

async fn watch<W>(
    device: &Device<GenericPeripheral>,
    args: &ConnectArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<StreamSummary>
where
    W: io::Write,
{
    let deadline = args.duration.map(|duration| Instant::now() + duration);
    let mut changes = device.subscribe();
    let mut emitted = 0;

    let stop_reason = loop {
        if args.max_updates.is_some_and(|max| emitted >= max) {
            break StopReason::LimitReached;
        }
        let generation = tokio::select! {
            generation = changes.changed() => generation,
            reason = super::stop_signal(deadline) => break reason,
        };
        if generation.is_none() {
            break StopReason::Ended;
        }

        emitted += 1;
        let summary = DeviceSummary::from_device(device);
        match output_format {
            OutputFormat::Pretty => {
                writeln!(out, "{}", DeviceUpdateView::new(emitted, &summary, painter))?;
            }
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &summary)?;
                writeln!(out)?;
            }
        }
    };

    info!(emitted, %stop_reason, "watch finished");
    Ok(StreamSummary {
        emitted,
        stop_reason,
    })
}

async fn disconnect(device: &Device<GenericPeripheral>) {
    let mut connection = device.watch_state();
    device.disconnect();
    let confirmed = time::timeout(
        DISCONNECT_GRACE,
        connection.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await;
    if !matches!(confirmed, Ok(Ok(_))) {
        debug!(peripheral = %device.id(), "disconnection was not confirmed");
    }
}
