//! Command-line surface for the `tubular` controller binary.
//!
//! Grounded on `gofer::cli::service`: a `service start` subcommand with an
//! optional `--config` path override.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "tubular", about = "tubular pipeline controller")]
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
    /// Starts the controller's scheduler, trigger engine, and HTTP server, and
    /// blocks until shutdown.
    Start {
        /// Path to a tubular.toml config file, overriding the default search path.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}
