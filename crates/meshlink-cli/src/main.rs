//! meshlink - run a mesh node over Bluetooth LE and the local network

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshlink_cli::{
    cli::{Cli, Commands},
    commands,
    config::NodeConfig,
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Config => commands::print_config(),
        Commands::Run(_) => {
            let config = NodeConfig::load(cli.config.as_deref(), &cli.overrides())?;
            info!("Starting meshlink node");
            commands::run(config).await?;
            info!("meshlink exited successfully");
            Ok(())
        }
    }
}

/// RUST_LOG wins over the verbosity flag
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
