//! `iop` entry point: parses CLI arguments and dispatches into the
//! deployment coordinator.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use iop::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    cli::run(cli).await
}
