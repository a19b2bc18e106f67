use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::hw::{BtleplugTransport, FakeTransport, GattTransport};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Opens the host's first BLE adapter.
///
/// # Errors
///
/// Returns an error if no adapter is available or the BLE stack fails.
pub async fn real_transport() -> Result<Arc<dyn GattTransport>> {
    Ok(Arc::new(BtleplugTransport::new().await?))
}

/// Creates a transport backed by fake peripheral fixtures.
#[must_use]
pub fn fake_transport(fake_args: FakeArgs) -> Arc<dyn GattTransport> {
    Arc::new(FakeTransport::new(fake_args.into_peripherals()))
}

/// Runs the CLI command against `transport`.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = gatt_mirror::Args::try_parse_from([
///     "gatt-mirror",
///     "--fake",
///     "--fake-peripherals",
///     "AA:BB|Thermo|-40|64",
///     "scan",
///     "--max-snapshots",
///     "1",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let transport = match maybe_fake_args {
///     Some(fake_args) => gatt_mirror::fake_transport(fake_args),
///     None => gatt_mirror::real_transport().await?,
/// };
/// let mut out = Vec::new();
/// gatt_mirror::run(command, &mut out, transport, None, gatt_mirror::OutputFormat::Json).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run<W>(
    command: Command,
    out: &mut W,
    transport: Arc<dyn GattTransport>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(
        command,
        out,
        &SystemTerminalClient,
        transport,
        log_level,
        output_format,
    )
    .await
}

/// Runs the CLI command with an injected terminal client.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
#[instrument(
    skip(out, terminal_client, transport),
    level = "info",
    fields(command = command.name(), ?log_level)
)]
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    transport: Arc<dyn GattTransport>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "gatt-mirror",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    match command {
        Command::Scan(args) => {
            crate::cli::scan::run(transport, &args, out, terminal_client, output_format).await
        }
        Command::Connect(args) => {
            crate::cli::connect::run(transport, &args, out, terminal_client, output_format).await
        }
    }
}
