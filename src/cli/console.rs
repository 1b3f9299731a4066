use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, ValueEnum};
use serde::Serialize;
use serde_with::{SerializeDisplay, hex::Hex, serde_as};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument};

use crate::cli::command::{OutputFormat, parse_duration};
use crate::dispatch::{ForegroundLoop, SerialService};
use crate::event::SerialEvent;
use crate::hw::{FoundDevice, HardwareClient};
use crate::terminal::TerminalClient;

use super::ui::{ConnectedView, DataView, Painter, Spinner, SummaryView};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Arguments for the `terminal` command.
#[derive(Debug, Clone, Args)]
pub struct TerminalArgs {
    /// Connect to the first peripheral whose local name starts with this prefix.
    #[arg(long, default_value = "")]
    name_prefix: String,
    /// Line ending appended to every input line.
    #[arg(long, value_enum, default_value_t = Newline::Crlf)]
    newline: Newline,
    /// Treat input lines as hex-encoded bytes instead of text.
    #[arg(long)]
    hex: bool,
    /// Stop after this many received chunks. If omitted, run until input closes or Ctrl+C.
    #[arg(long)]
    max_reads: Option<usize>,
    /// How long to wait for the serial session to come up (e.g. `5s`).
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    connect_timeout: Duration,
    /// Once input closes, stop after this long without received data.
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    idle_timeout: Duration,
}

impl Default for TerminalArgs {
    fn default() -> Self {
        Self {
            name_prefix: String::new(),
            newline: Newline::Crlf,
            hex: false,
            max_reads: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl TerminalArgs {
    /// Restricts the scan to peripherals whose local name starts with `name_prefix`.
    #[must_use]
    pub fn with_name_prefix(mut self, name_prefix: impl Into<String>) -> Self {
        self.name_prefix = name_prefix.into();
        self
    }

    #[must_use]
    pub fn with_newline(mut self, newline: Newline) -> Self {
        self.newline = newline;
        self
    }

    /// Parses input lines as hex instead of sending them as text.
    #[must_use]
    pub fn with_hex_input(mut self, hex: bool) -> Self {
        self.hex = hex;
        self
    }

    #[must_use]
    pub fn with_max_reads(mut self, max_reads: Option<usize>) -> Self {
        self.max_reads = max_reads;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Converts one input line into the bytes sent to the peripheral.
    fn encode_line(&self, line: &str) -> Result<Vec<u8>> {
        if self.hex {
            let digits: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            return hex::decode(&digits).with_context(|| format!("invalid hex input `{line}`"));
        }

        let mut payload = line.as_bytes().to_vec();
        payload.extend_from_slice(self.newline.as_bytes());
        Ok(payload)
    }
}

/// Line ending appended to text input.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum Newline {
    Crlf,
    Lf,
    Cr,
    None,
}

impl Newline {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Crlf => b"\r\n",
            Self::Lf => b"\n",
            Self::Cr => b"\r",
            Self::None => b"",
        }
    }
}

/// Direction of a data chunk relative to this host.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub(crate) enum Direction {
    #[display("rx")]
    Rx,
    #[display("tx")]
    Tx,
}

/// Why a terminal session ended.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub(crate) enum StopReason {
    #[display("reached max reads ({_0})")]
    ReachedLimit(usize),
    #[display("input closed")]
    InputClosed,
    #[display("interrupted by user")]
    Interrupted,
    #[display("connection lost: {_0}")]
    ConnectionLost(String),
}

/// Counters reported when a terminal session ends.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct SessionSummary {
    reads: usize,
    writes: usize,
    stop_reason: StopReason,
}

impl SessionSummary {
    pub(crate) fn new(reads: usize, writes: usize, stop_reason: StopReason) -> Self {
        Self {
            reads,
            writes,
            stop_reason,
        }
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes
    }

    pub(crate) fn stop_reason(&self) -> &StopReason {
        &self.stop_reason
    }
}

/// JSON line emitted for each session event.
#[serde_as]
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SessionRecord<'a> {
    Connected {
        adapter: &'a str,
        device_id: &'a str,
        name: Option<&'a str>,
        rssi: Option<i16>,
        profile: Option<String>,
        payload_size: Option<usize>,
    },
    Data {
        direction: Direction,
        index: usize,
        #[serde_as(as = "Hex")]
        bytes: &'a [u8],
    },
    Summary {
        reads: usize,
        writes: usize,
        stop_reason: &'a StopReason,
    },
}

/// Renders session output in the selected format.
struct SessionOutput<'a, W> {
    out: &'a mut W,
    format: OutputFormat,
    painter: Painter,
}

impl<W> SessionOutput<'_, W>
where
    W: io::Write,
{
    fn connected(&mut self, device: &FoundDevice, service: &SerialService) -> Result<()> {
        let profile = service.profile();
        let payload_size = service.payload_size();
        match self.format {
            OutputFormat::Pretty => {
                let view = ConnectedView::new(device, profile, payload_size, &self.painter);
                writeln!(self.out, "{view}")?;
                writeln!(self.out)?;
            }
            OutputFormat::Json => write_json_line(
                self.out,
                &SessionRecord::Connected {
                    adapter: device.adapter_name(),
                    device_id: device.peripheral_id().as_str(),
                    name: device.local_name(),
                    rssi: device.rssi(),
                    profile: profile.map(|profile| profile.to_string()),
                    payload_size,
                },
            )?,
        }
        Ok(())
    }

    fn data(&mut self, direction: Direction, index: usize, payload: &[u8]) -> Result<()> {
        match self.format {
            OutputFormat::Pretty => {
                let view = DataView::new(direction, index, payload, &self.painter);
                writeln!(self.out, "{view}")?;
            }
            OutputFormat::Json => write_json_line(
                self.out,
                &SessionRecord::Data {
                    direction,
                    index,
                    bytes: payload,
                },
            )?,
        }
        Ok(())
    }

    fn summary(&mut self, summary: &SessionSummary) -> Result<()> {
        match self.format {
            OutputFormat::Pretty => {
                writeln!(self.out)?;
                writeln!(self.out, "{}", SummaryView::new(summary, &self.painter))?;
            }
            OutputFormat::Json => write_json_line(
                self.out,
                &SessionRecord::Summary {
                    reads: summary.reads(),
                    writes: summary.writes(),
                    stop_reason: summary.stop_reason(),
                },
            )?,
        }
        Ok(())
    }
}

/// Executes the `terminal` command, bridging `input` lines to the peripheral and
/// received data to `out`.
#[instrument(skip_all, level = "info", fields(name_prefix = %args.name_prefix))]
pub(crate) async fn run<R, W>(
    client: Box<dyn HardwareClient>,
    args: &TerminalArgs,
    input: R,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    let spinner = Spinner::new(
        output_format == OutputFormat::Pretty && terminal_client.stderr_is_terminal(),
    );
    let name_prefix = args.name_prefix.as_str();
    let discovered = spinner
        .with_spinner(
            "Scanning for serial peripherals",
            "Found peripheral",
            "Scan failed",
            move || client.find_first_device(name_prefix),
        )
        .await?;
    let device = discovered.device().clone();
    info!(peripheral = %device.peripheral_id(), "opening serial session");

    let mut foreground = ForegroundLoop::new();
    let service = SerialService::new(foreground.handle());
    let (sender, mut events) = unbounded_channel();
    service.attach(Arc::new(sender))?;
    service.connect(discovered.radio().as_ref(), device.peripheral_id().clone())?;

    let setup = await_connected(&mut foreground, &mut events, args.connect_timeout);
    let connected = spinner
        .with_spinner(
            "Opening serial session",
            "Connected",
            "Connection failed",
            move || setup,
        )
        .await;
    if let Err(error) = connected {
        service.disconnect();
        return Err(error);
    }

    let mut output = SessionOutput {
        out,
        format: output_format,
        painter: Painter::for_stdout(terminal_client),
    };
    output.connected(&device, &service)?;

    let session = pump_session(
        args,
        input,
        &mut foreground,
        &mut events,
        &service,
        &mut output,
    )
    .await;
    service.disconnect();
    let summary = session?;
    output.summary(&summary)?;

    match summary.stop_reason() {
        StopReason::ConnectionLost(reason) => Err(anyhow!("serial connection lost: {reason}")),
        _ => Ok(()),
    }
}

/// Drives the foreground loop until setup succeeds, fails, or `limit` elapses.
async fn await_connected(
    foreground: &mut ForegroundLoop,
    events: &mut UnboundedReceiver<SerialEvent>,
    limit: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            tokio::select! {
                () = foreground.run_once() => {}
                event = events.recv() => match event {
                    Some(SerialEvent::Connected) => return Ok(()),
                    Some(SerialEvent::ConnectError(error) | SerialEvent::IoError(error)) => {
                        return Err(anyhow::Error::new(error).context("failed to open serial session"));
                    }
                    Some(event) => debug!(kind = event.kind(), "ignoring event before setup finished"),
                    None => return Err(anyhow!("serial event stream closed during setup")),
                },
            }
        }
    };

    timeout(limit, wait).await.map_err(|_elapsed| {
        anyhow!(
            "timed out after {} waiting for the serial session",
            humantime::format_duration(limit)
        )
    })?
}

async fn pump_session<R, W>(
    args: &TerminalArgs,
    input: R,
    foreground: &mut ForegroundLoop,
    events: &mut UnboundedReceiver<SerialEvent>,
    service: &SerialService,
    output: &mut SessionOutput<'_, W>,
) -> Result<SessionSummary>
where
    R: AsyncBufRead + Unpin,
    W: io::Write,
{
    let mut lines = input.lines();
    let mut input_open = true;
    let mut reads = 0usize;
    let mut writes = 0usize;

    let stop_reason = loop {
        if let Some(limit) = args.max_reads
            && reads >= limit
        {
            break StopReason::ReachedLimit(limit);
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                break StopReason::Interrupted;
            }
            () = foreground.run_once() => {}
            event = events.recv() => match event {
                Some(SerialEvent::DataReceived(payload)) => {
                    reads += 1;
                    output.data(Direction::Rx, reads, &payload)?;
                }
                Some(SerialEvent::IoError(error) | SerialEvent::ConnectError(error)) => {
                    break StopReason::ConnectionLost(error.to_string());
                }
                Some(SerialEvent::Connected) => {}
                None => break StopReason::ConnectionLost("event stream closed".to_string()),
            },
            line = lines.next_line(), if input_open => match line.context("failed to read input")? {
                Some(line) => {
                    let payload = args.encode_line(&line)?;
                    if payload.is_empty() {
                        continue;
                    }
                    service.write(&payload)?;
                    writes += 1;
                    output.data(Direction::Tx, writes, &payload)?;
                }
                None => {
                    debug!("input closed");
                    input_open = false;
                }
            },
            () = sleep(args.idle_timeout), if !input_open => break StopReason::InputClosed,
        }
    };

    Ok(SessionSummary::new(reads, writes, stop_reason))
}

fn write_json_line(out: &mut impl io::Write, value: &impl Serialize) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::crlf(Newline::Crlf, b"AT\r\n".as_slice())]
    #[case::lf(Newline::Lf, b"AT\n".as_slice())]
    #[case::cr(Newline::Cr, b"AT\r".as_slice())]
    #[case::none(Newline::None, b"AT".as_slice())]
    fn text_lines_get_the_selected_line_ending(#[case] newline: Newline, #[case] expected: &[u8]) {
        let args = TerminalArgs::default().with_newline(newline);
        assert_eq!(expected, args.encode_line("AT").expect("text encodes"));
    }

    #[test]
    fn hex_lines_ignore_whitespace_and_line_endings() {
        let args = TerminalArgs::default().with_hex_input(true);
        assert_eq!(
            vec![0x01, 0xAB, 0xFF],
            args.encode_line("01 ab\tff").expect("valid hex")
        );
    }

    #[test]
    fn invalid_hex_line_is_an_error() {
        let args = TerminalArgs::default().with_hex_input(true);
        let error = args.encode_line("0g").expect_err("invalid hex");
        assert_eq!("invalid hex input `0g`", error.to_string());
    }

    #[test]
    fn empty_line_without_line_ending_encodes_to_nothing() {
        let args = TerminalArgs::default().with_newline(Newline::None);
        assert_matches!(args.encode_line("").as_deref(), Ok([]));
    }

    #[test]
    fn data_record_serialises_bytes_as_hex() {
        let mut out = Vec::new();
        write_json_line(
            &mut out,
            &SessionRecord::Data {
                direction: Direction::Rx,
                index: 1,
                bytes: b"OK",
            },
        )
        .expect("serialises");
        assert_eq!(
            "{\"event\":\"data\",\"direction\":\"rx\",\"index\":1,\"bytes\":\"4f4b\"}\n",
            String::from_utf8(out).expect("utf8")
        );
    }

    #[test]
    fn summary_record_renders_stop_reason_text() {
        let mut out = Vec::new();
        let stop_reason = StopReason::ReachedLimit(2);
        write_json_line(
            &mut out,
            &SessionRecord::Summary {
                reads: 2,
                writes: 1,
                stop_reason: &stop_reason,
            },
        )
        .expect("serialises");
        assert_eq!(
            "{\"event\":\"summary\",\"reads\":2,\"writes\":1,\"stop_reason\":\"reached max reads (2)\"}\n",
            String::from_utf8(out).expect("utf8")
        );
    }
}
