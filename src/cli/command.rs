use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::console::TerminalArgs;
use crate::error::{CliConfigError, FixtureError};
use crate::hw::{FakeBackendConfig, NotificationPayloads, ScanFixture};
use crate::protocol::VendorProfile;

/// Command-line options for the BLE serial terminal.
#[derive(Debug, Parser)]
#[command(
    name = "ble-serial",
    about = "Talk to BLE serial-port peripherals from the terminal."
)]
pub struct Args {
    /// Log level; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output_format: Option<OutputFormat>,
    /// Uses the fake BLE backend with fixture-driven discovery and an emulated peripheral.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `adapter|device_id|local_name|rssi;...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Serial profile emulated by the fake peripheral.
    #[arg(long, global = true, requires = "fake", value_enum)]
    fake_profile: Option<VendorProfile>,
    /// MTU granted by the fake peripheral. If omitted, MTU negotiation fails.
    #[arg(long, global = true, requires = "fake")]
    fake_mtu: Option<u16>,
    /// Notifications sent by the fake peripheral after connecting, as comma-separated hex.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Write credits handed out by a fake credit-flow peripheral.
    #[arg(long, global = true, requires = "fake")]
    fake_write_credits: Option<u8>,
    /// Disables loopback of written data by the fake peripheral.
    #[arg(long, global = true, requires = "fake")]
    fake_no_echo: bool,
    /// Artificial fake scan delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use ble_serial::{Args, Command, TerminalArgs};
    ///
    /// let args = Args::new(Command::Terminal(TerminalArgs::default()));
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output_format: None,
            fake: false,
            fake_scan: None,
            fake_profile: None,
            fake_mtu: None,
            fake_notifications: None,
            fake_write_credits: None,
            fake_no_echo: false,
            fake_discovery_delay: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            profile,
            granted_mtu,
            notifications,
            write_credits,
            echo,
            discovery_delay,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_profile = Some(profile);
        self.fake_mtu = granted_mtu;
        self.fake_notifications = notifications;
        self.fake_write_credits = write_credits;
        self.fake_no_echo = !echo;
        self.fake_discovery_delay = Some(discovery_delay);
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
        self.output_format
    }

    /// Splits parsed CLI arguments into command and optional fake-client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            log_level: _,
            output_format: _,
            fake,
            fake_scan,
            fake_profile,
            fake_mtu,
            fake_notifications,
            fake_write_credits,
            fake_no_echo,
            fake_discovery_delay,
            command,
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                profile: fake_profile.unwrap_or(VendorProfile::Nordic),
                granted_mtu: fake_mtu,
                notifications: fake_notifications,
                write_credits: fake_write_credits,
                echo: !fake_no_echo,
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(default = VendorProfile::Nordic)]
    profile: VendorProfile,
    granted_mtu: Option<u16>,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    write_credits: Option<u8>,
    #[builder(default = true)]
    echo: bool,
    #[builder(default)]
    discovery_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_backend_config(self) -> FakeBackendConfig {
        let Self {
            scan_fixture,
            profile,
            granted_mtu,
            notifications,
            write_credits,
            echo,
            discovery_delay,
        } = self;

        FakeBackendConfig::builder()
            .scan_fixture(scan_fixture)
            .profile(profile)
            .maybe_granted_mtu(granted_mtu)
            .maybe_notifications(notifications)
            .maybe_write_credits(write_credits)
            .echo(echo)
            .discovery_delay(discovery_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for the first matching peripheral, open a serial session and bridge it to stdin/stdout.
    Terminal(TerminalArgs),
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error => LevelFilter::ERROR,
        }
    }
}

/// Rendering of command output.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, optionally coloured text.
    Pretty,
    /// One JSON object per line.
    Json,
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
