use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;

use ble_serial::{
    Args, OutputFormat, fake_hardware_client, real_hardware_client, run_with_log_level,
};

fn main() -> ExitCode {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("error: failed to start async runtime: {error}");
            return ExitCode::from(1);
        }
    };

    let run_result = runtime.block_on(run_cli(args));
    // A blocked stdin read would otherwise hold up runtime shutdown.
    runtime.shutdown_background();

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_cli(args: Args) -> Result<()> {
    let mut stdout = std::io::stdout();
    let log_level = args.log_level();
    let output_format = args.output_format().unwrap_or(if stdout.is_terminal() {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    });
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let hardware_client = match maybe_fake_args {
        Some(fake_args) => fake_hardware_client(fake_args),
        None => real_hardware_client(),
    };

    run_with_log_level(
        command,
        BufReader::new(tokio::io::stdin()),
        &mut stdout,
        hardware_client,
        log_level,
        output_format,
    )
    .await
}
