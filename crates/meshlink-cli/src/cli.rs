//! Command-line interface definitions and parsing

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path, layered over ./meshlink.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for routing engine storage
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Directory for routing engine caches
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a mesh node until interrupted
    Run(RunArgs),
    /// Print an example configuration file
    Config,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Disable the Bluetooth LE transport
    #[arg(long)]
    pub no_bluetooth: bool,

    /// Disable Bonjour discovery on the local network
    #[arg(long)]
    pub no_bonjour: bool,

    /// Disable multicast discovery in the routing engine
    #[arg(long)]
    pub no_multicast: bool,

    /// Relay traffic for other nodes
    #[arg(long)]
    pub relay: bool,

    /// Connect to this static peer
    #[arg(long, value_name = "URI")]
    pub static_peer: Option<String>,

    /// Address the Bonjour listener binds
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Node public key (hex); random when absent
    #[arg(long, value_name = "HEX")]
    pub key: Option<String>,

    /// Seconds between peer summaries
    #[arg(long, value_name = "SECS")]
    pub status_interval: Option<u64>,
}

impl Cli {
    /// Flags that override every other configuration layer
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            storage_dir: self.storage_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            ..Default::default()
        };

        if let Commands::Run(args) = &self.command {
            overrides.bluetooth_disabled = args.no_bluetooth.then_some(true);
            overrides.bonjour_disabled = args.no_bonjour.then_some(true);
            overrides.multicast_disabled = args.no_multicast.then_some(true);
            overrides.relaying_enabled = args.relay.then_some(true);
            overrides.static_peer = args.static_peer.clone();
            overrides.listen_addr = args.listen;
            overrides.public_key = args.key.clone();
            overrides.status_interval_secs = args.status_interval;
        }
        overrides
    }
}
