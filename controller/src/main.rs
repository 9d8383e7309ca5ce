use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tubular_controller::cli::{Cli, Commands, ServiceCommands};
use tubular_controller::conf::ControllerConfig;
use tubular_controller::scheduler::Scheduler;
use tubular_controller::state::{ControllerState, PipelineRepoIdentity};
use tubular_controller::storage::Db;
use tubular_controller::{api, config_reload, trigger};
use tubular_core::config::Configuration;

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Commands::Service(ServiceCommands::Start { config }) = cli.command;

    let config: ControllerConfig = Configuration::<ControllerConfig>::load(config)?;
    let config = config.apply_legacy_env();

    init_tracing(&config.log_level);

    let workspace = PathBuf::from(&config.workspace);
    std::fs::create_dir_all(&workspace)?;

    let db_path = workspace.join("tubular.db");
    let db = Db::new(&db_path.to_string_lossy())?;

    let scheduler = Scheduler::new(Default::default());
    let state = ControllerState::new(
        db,
        Arc::clone(&scheduler),
        workspace,
        PipelineRepoIdentity {
            url: String::new(),
            default_branch: config.default_branch.clone(),
        },
    );

    if !config.config_repo_url.is_empty() {
        if let Err(e) = config_reload::reload(&state, &config.config_repo_url, &config.config_repo_branch) {
            tracing::error!(error = %e, "initial config load failed, starting with an empty config");
        }
    }

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.run_loop())
    };

    let trigger_should_run = Arc::new(AtomicBool::new(true));
    let trigger_handle = {
        let state = Arc::clone(&state);
        let should_run = Arc::clone(&trigger_should_run);
        let config_repo = if config.config_repo_url.is_empty() {
            None
        } else {
            Some((config.config_repo_url.clone(), config.config_repo_branch.clone()))
        };
        std::thread::spawn(move || trigger::run_loop(state, should_run, config_repo))
    };

    let addr = config.bind_address.parse()?;
    let serve_result = api::serve(Arc::clone(&state), addr).await;

    trigger_should_run.store(false, std::sync::atomic::Ordering::SeqCst);
    scheduler.shutdown();
    let _ = scheduler_handle.join();
    let _ = trigger_handle.join();

    serve_result
}
