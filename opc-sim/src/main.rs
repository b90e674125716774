mod cli;
mod commands;
mod sim;

use crate::cli::Cli;
use crate::commands::Simulation;
use crate::sim::SimConfig;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "opc-sim.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_filter(filter))
        .init();

    tracing::info!(command = ?cli.command, "Starting OPC simulator");

    let config = match &cli.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::demo(),
    };
    let simulation = Simulation::new(config)?;
    let generator = simulation.start_generator();

    let mut stdout = std::io::stdout().lock();
    let res = commands::run(cli.command, &simulation, &mut stdout).await;
    generator.abort();

    if let Err(err) = &res {
        tracing::error!(error = ?err, "Command failed");
    }
    res
}
