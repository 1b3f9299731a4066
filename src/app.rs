use std::io;

use anyhow::Result;
use tokio::io::AsyncBufRead;
use tracing::instrument;

use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::hw::{
    HardwareClient, fake_hardware_client as build_fake_hardware_client,
    real_hardware_client as build_real_hardware_client,
};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

const SERVICE_NAME: &str = "ble-serial";

/// Creates a hardware client backed by the real BLE transport.
#[must_use]
pub fn real_hardware_client() -> Box<dyn HardwareClient> {
    build_real_hardware_client()
}

/// Creates a hardware client backed by fake BLE fixtures and an emulated peripheral.
#[must_use]
pub fn fake_hardware_client(fake_args: FakeArgs) -> Box<dyn HardwareClient> {
    build_fake_hardware_client(fake_args.into_backend_config())
}

/// Runs the CLI command against the process terminal.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = ble_serial::Args::try_parse_from([
///     "ble-serial",
///     "--fake",
///     "--fake-scan",
///     "hci0|AA:BB:CC|HMSoft|-43",
///     "terminal",
///     "--max-reads",
///     "1",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => ble_serial::fake_hardware_client(fake_args),
///     None => ble_serial::real_hardware_client(),
/// };
/// let input = tokio::io::BufReader::new(b"AT\n".as_slice());
/// let mut out = Vec::new();
/// ble_serial::run(
///     command,
///     input,
///     &mut out,
///     hardware_client,
///     ble_serial::OutputFormat::Json,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run<R, W>(
    command: Command,
    input: R,
    out: &mut W,
    hardware_client: Box<dyn HardwareClient>,
    output_format: OutputFormat,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    run_with_log_level(command, input, out, hardware_client, None, output_format).await
}

/// Runs the CLI command with an explicit telemetry log-level override.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run_with_log_level<R, W>(
    command: Command,
    input: R,
    out: &mut W,
    hardware_client: Box<dyn HardwareClient>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    run_with_clients_and_log_level(
        command,
        input,
        out,
        &SystemTerminalClient,
        hardware_client,
        log_level,
        output_format,
    )
    .await
}

/// Runs the CLI command with injected clients.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run_with_clients<R, W>(
    command: Command,
    input: R,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    hardware_client: Box<dyn HardwareClient>,
    output_format: OutputFormat,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    run_with_clients_and_log_level(
        command,
        input,
        out,
        terminal_client,
        hardware_client,
        None,
        output_format,
    )
    .await
}

/// Runs the CLI command with injected clients and explicit telemetry settings.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl ble_serial::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = ble_serial::Args::try_parse_from([
///     "ble-serial",
///     "--log-level",
///     "trace",
///     "--fake",
///     "--fake-scan",
///     "hci0|AA:BB:CC|HMSoft|-43",
///     "--fake-profile",
///     "cc254x",
///     "terminal",
///     "--max-reads",
///     "1",
/// ])?;
/// let log_level = args.log_level();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let hardware_client = match maybe_fake_args {
///     Some(fake_args) => ble_serial::fake_hardware_client(fake_args),
///     None => ble_serial::real_hardware_client(),
/// };
/// let input = tokio::io::BufReader::new(b"AT\n".as_slice());
/// let mut out = Vec::new();
/// ble_serial::run_with_clients_and_log_level(
///     command,
///     input,
///     &mut out,
///     &FakeTerminal,
///     hardware_client,
///     log_level,
///     ble_serial::OutputFormat::Pretty,
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
#[instrument(
    skip(input, out, terminal_client, hardware_client),
    level = "info",
    fields(command = %command_name(&command), ?log_level)
)]
pub async fn run_with_clients_and_log_level<R, W>(
    command: Command,
    input: R,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    hardware_client: Box<dyn HardwareClient>,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    telemetry::initialise_tracing(
        SERVICE_NAME,
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    match command {
        Command::Terminal(args) => {
            crate::cli::console::run(
                hardware_client,
                &args,
                input,
                out,
                terminal_client,
                output_format,
            )
            .await
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Terminal(_args) => "terminal",
    }
}
