mod cli;
mod conf;
mod server;
mod worker;

use clap::Parser;
use cli::{Cli, Commands, ServiceCommands};
use conf::NodeConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tubular_core::config::Configuration;
use worker::NodeWorker;

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Commands::Service(ServiceCommands::Start { config }) = cli.command;

    let config: NodeConfig = Configuration::<NodeConfig>::load(config)?;
    let config = config.apply_legacy_env();

    init_tracing(&config.log_level);

    let addr = config.bind_address.parse()?;
    let workspace = PathBuf::from(&config.workspace);
    std::fs::create_dir_all(&workspace)?;

    let worker = NodeWorker::new(workspace);
    server::serve(worker, addr).await
}
