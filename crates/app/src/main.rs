mod cli;

use anyhow::Result;
use clap::Parser;
use vision::{RelayConfig, pipeline::state::StopReason};

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("{err:?}");
            std::process::exit(1);
        }
    }
}

/// Returns whether the relay ended without a failure.
fn run() -> Result<bool> {
    let cli = cli::Cli::parse();
    let config = RelayConfig::try_from(cli.relay)?;
    let report = vision::run(config)?;
    Ok(!matches!(
        report.stop_reason,
        Some(StopReason::SourceFailed | StopReason::StageFailed)
    ))
}
