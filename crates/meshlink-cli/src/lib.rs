//! Meshlink CLI library
//!
//! Argument parsing, layered configuration and the long-running node command
//! behind the `meshlink` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands, RunArgs};
pub use config::{ConfigOverrides, NodeConfig, NodeOptions};
pub use error::{CliError, Result};
