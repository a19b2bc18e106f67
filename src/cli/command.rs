use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::connect::ConnectArgs;
use crate::cli::scan::ScanArgs;
use crate::error::{CliConfigError, FixtureError};
use crate::hw::{FakePeripheral, FakePeripherals};

/// Command-line options for the GATT mirroring tool.
#[derive(Debug, Parser)]
#[command(
    name = "gatt-mirror",
    about = "Discover BLE peripherals and mirror their GATT characteristics."
)]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG` when given.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputFormat>,
    /// Uses the fake BLE backend with fixture-driven peripherals.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake peripherals in the form `id|name|rssi[|battery_hex];...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_peripherals: Option<FakePeripherals>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use gatt_mirror::{Args, Command, ScanArgs};
    ///
    /// let args = Args::new(Command::Scan(ScanArgs::default()));
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            format: None,
            fake: false,
            fake_peripherals: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        self.fake = true;
        self.fake_peripherals = Some(fake.peripherals);
        self
    }

    /// Returns the explicit log level, if any.
    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Returns the explicit output format, if any.
    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.format
    }

    /// Splits parsed CLI arguments into command and optional fake-backend settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_peripherals,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(peripherals) = fake_peripherals else {
                return Err(CliConfigError::MissingFakePeripherals.into());
            };
            Some(FakeArgs { peripherals })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
///
/// ```
/// let fake = gatt_mirror::FakeArgs::builder()
///     .peripherals("AA:BB|Thermo|-40|64")?
///     .build();
/// let _ = fake;
/// # Ok::<(), gatt_mirror::FixtureError>(())
/// ```
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    peripherals: FakePeripherals,
}

impl FakeArgs {
    pub(crate) fn into_peripherals(self) -> Vec<FakePeripheral> {
        self.peripherals.into()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan and print every change to the set of nearby peripherals.
    Scan(ScanArgs),
    /// Scan for a peripheral by name, connect, and mirror its characteristics.
    Connect(ConnectArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_args) => "scan",
            Self::Connect(_args) => "connect",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, ValueEnum, strum_macros::Display, strum_macros::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Converts to the equivalent tracing filter.
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OutputFormat {
    /// Coloured tables for humans.
    Pretty,
    /// One JSON document per line.
    Json,
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
