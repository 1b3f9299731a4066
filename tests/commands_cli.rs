use std::time::Duration;

use clap::Parser;
use insta::assert_snapshot;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl ble_serial::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(
    args: ble_serial::Args,
    input: &str,
    output_format: ble_serial::OutputFormat,
) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let hardware_client = match maybe_fake_args {
        Some(fake_args) => ble_serial::fake_hardware_client(fake_args),
        None => ble_serial::real_hardware_client(),
    };
    ble_serial::run_with_clients(
        command,
        tokio::io::BufReader::new(input.as_bytes()),
        &mut output,
        &FakeTerminalClient,
        hardware_client,
        output_format,
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_json<const N: usize>(argv: [&str; N], input: &str) -> anyhow::Result<Vec<Value>> {
    let parsed_args = ble_serial::Args::try_parse_from(argv)?;
    let stdout = run_with_parsed_args(parsed_args, input, ble_serial::OutputFormat::Json).await?;
    stdout
        .lines()
        .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
        .collect()
}

#[tokio::test]
async fn terminal_prints_fixture_notifications() -> anyhow::Result<()> {
    let fake = ble_serial::FakeArgs::builder()
        .scan_fixture("hci1|00:11:22|Speaker|-65;hci0|AA:BB:CC|HMSoft|-43")?
        .profile(ble_serial::VendorProfile::Cc254x)
        .notifications("4f4b,0d0a")?
        .build();
    let terminal = ble_serial::TerminalArgs::default()
        .with_name_prefix("HM")
        .with_max_reads(Some(2));
    let args = ble_serial::Args::new(ble_serial::Command::Terminal(terminal)).with_fake(fake);

    let stdout = run_with_parsed_args(args, "", ble_serial::OutputFormat::Pretty).await?;

    assert_snapshot!(stdout.trim_end(), @r#"
    Connected device:
    ╭───────────┬──────────╮
    │ field     │ value    │
    ├───────────┼──────────┤
    │ adapter   │ hci0     │
    │ device_id │ AA:BB:CC │
    │ name      │ HMSoft   │
    │ rssi      │ -43      │
    ╰───────────┴──────────╯

    Serial session:
    ╭──────────────┬────────╮
    │ field        │ value  │
    ├──────────────┼────────┤
    │ profile      │ cc254x │
    │ payload_size │ 20     │
    ╰──────────────┴────────╯

    [0001] rx "OK" raw=4F 4B
    [0002] rx "\r\n" raw=0D 0A

    Stopped: reached max reads (2) - received 2 read(s), sent 0 write(s)
    "#);
    Ok(())
}

#[tokio::test]
async fn terminal_sends_input_lines_and_reports_echo_as_json() -> anyhow::Result<()> {
    let records = run_json(
        [
            "ble-serial",
            "--fake",
            "--fake-scan",
            "hci0|AA:BB:CC|HMSoft|-43",
            "--fake-profile",
            "nordic",
            "--fake-mtu",
            "247",
            "terminal",
            "--max-reads",
            "1",
        ],
        "AT\n",
    )
    .await?;

    assert_eq!(
        vec![
            json!({
                "event": "connected",
                "adapter": "hci0",
                "device_id": "AA:BB:CC",
                "name": "HMSoft",
                "rssi": -43,
                "profile": "nordic",
                "payload_size": 244,
            }),
            json!({"event": "data", "direction": "tx", "index": 1, "bytes": "41540d0a"}),
            json!({"event": "data", "direction": "rx", "index": 1, "bytes": "41540d0a"}),
            json!({
                "event": "summary",
                "reads": 1,
                "writes": 1,
                "stop_reason": "reached max reads (1)",
            }),
        ],
        records
    );
    Ok(())
}

#[tokio::test]
async fn terminal_sends_hex_input_over_credit_flow() -> anyhow::Result<()> {
    let records = run_json(
        [
            "ble-serial",
            "--fake",
            "--fake-scan",
            "hci0|AA:BB:CC|TIO-Bridge|-51",
            "--fake-profile",
            "telit_tio",
            "--fake-write-credits",
            "1",
            "terminal",
            "--hex",
            "--max-reads",
            "2",
        ],
        "48 49\n0a\n",
    )
    .await?;

    let received: Vec<&Value> = records
        .iter()
        .filter(|record| record["direction"] == "rx")
        .map(|record| &record["bytes"])
        .collect();
    assert_eq!(vec![&json!("4849"), &json!("0a")], received);
    assert_eq!(Some(&json!("telit_tio")), records[0].get("profile"));
    Ok(())
}

#[tokio::test]
async fn terminal_stops_once_input_closes_and_the_link_goes_quiet() -> anyhow::Result<()> {
    let records = run_json(
        [
            "ble-serial",
            "--fake",
            "--fake-scan",
            "hci0|AA:BB:CC|HMSoft|-43",
            "--fake-no-echo",
            "terminal",
            "--newline",
            "lf",
            "--idle-timeout",
            "50ms",
        ],
        "AT\n\n",
    )
    .await?;

    let summary = records.last().cloned().unwrap_or_default();
    assert_eq!(
        json!({
            "event": "summary",
            "reads": 0,
            "writes": 2,
            "stop_reason": "input closed",
        }),
        summary
    );
    Ok(())
}

#[tokio::test]
async fn terminal_fails_when_no_device_matches() -> anyhow::Result<()> {
    let result = run_json(
        [
            "ble-serial",
            "--fake",
            "--fake-scan",
            "hci0|AA:BB:CC|Speaker|-43",
            "terminal",
            "--name-prefix",
            "HM",
        ],
        "",
    )
    .await;

    let error = result.expect_err("unmatched prefix should fail");
    assert_eq!(
        "no peripheral matching `HM*` was found in the fake fixture",
        error.to_string()
    );
    Ok(())
}

#[tokio::test]
async fn fake_discovery_delay_is_honoured() -> anyhow::Result<()> {
    let fake = ble_serial::FakeArgs::builder()
        .scan_fixture("hci0|AA:BB:CC|HMSoft|-43")?
        .discovery_delay(Duration::from_millis(100))
        .build();
    let terminal = ble_serial::TerminalArgs::default().with_idle_timeout(Duration::from_millis(10));
    let args = ble_serial::Args::new(ble_serial::Command::Terminal(terminal)).with_fake(fake);

    let started = std::time::Instant::now();
    run_with_parsed_args(args, "", ble_serial::OutputFormat::Json).await?;

    assert!(started.elapsed() >= Duration::from_millis(100));
    Ok(())
}

#[test]
fn fake_args_builder_rejects_invalid_fixture() {
    let result = ble_serial::FakeArgs::builder().scan_fixture("invalid-record");
    assert!(matches!(
        result,
        Err(ble_serial::FixtureError::InvalidRecordFieldCount)
    ));
}

#[test]
fn terminal_rejects_unknown_newline() {
    let result = ble_serial::Args::try_parse_from(["ble-serial", "terminal", "--newline", "nl"]);
    let error = result.expect_err("unknown newline should fail");
    assert_eq!(clap::error::ErrorKind::InvalidValue, error.kind());
}
