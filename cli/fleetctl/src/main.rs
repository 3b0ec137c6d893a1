//! fleetctl - start and stop fleets of self-hosted runners.
//!
//! `fleetctl start` provisions compute instances, waits until every one of
//! them has registered as a runner and prints the label to instance mapping.
//! `fleetctl stop` tears a fleet down by its base label.
//!
//! Logs go to stderr; stdout carries only the result.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod error;
mod output;

use commands::{Cli, LogFormat};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format());

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
}
