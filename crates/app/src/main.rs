mod cli;
mod vision;

use anyhow::Context;
use clap::Parser;

use crate::{cli::CliArgs, vision::ServerConfig};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let _telemetry = vision::telemetry::init_tracing(&args.telemetry_options());
    let config = ServerConfig::load(&args).context("invalid configuration")?;
    vision::run(config)
}
