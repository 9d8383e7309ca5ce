//! Command-line surface for the `tubular-node` binary.
//!
//! Grounded on `gofer`'s `cli::service` module: a `service start` subcommand
//! that takes an optional `--config` path override.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tubular-node", about = "tubular pipeline node worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Service administration commands.
    #[command(subcommand)]
    Service(ServiceCommands),
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Starts the node's HTTP server and blocks until shutdown.
    Start {
        /// Path to a tubular-node.toml config file, overriding the default search path.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
