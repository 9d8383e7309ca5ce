use serde::Deserialize;
use std::path::PathBuf;
use tubular_core::config::ConfigType;

const DEFAULT_NODE_CONFIG: &str = include_str!("./default_node_config.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub log_level: String,
    pub bind_address: String,
    pub workspace: String,
    pub config_repo_url: String,
    pub config_repo_branch: String,
}

impl ConfigType for NodeConfig {
    fn default_config() -> &'static str {
        DEFAULT_NODE_CONFIG
    }

    fn config_paths() -> Vec<PathBuf> {
        vec![PathBuf::from("/etc/tubular/tubular-node.toml")]
    }

    fn env_prefix() -> &'static str {
        "TUBULAR_NODE_"
    }
}

impl NodeConfig {
    /// Honors the bare `TUBULAR_WORKSPACE`/`TUBULAR_CONFIG_REPO`/
    /// `TUBULAR_CONFIG_REPO_BRANCH` env vars from spec.md §6 as overrides layered on
    /// top of the figment-resolved config.
    pub fn apply_legacy_env(mut self) -> Self {
        if let Ok(v) = std::env::var("TUBULAR_WORKSPACE") {
            self.workspace = v;
        }
        if let Ok(v) = std::env::var("TUBULAR_CONFIG_REPO") {
            self.config_repo_url = v;
        }
        if let Ok(v) = std::env::var("TUBULAR_CONFIG_REPO_BRANCH") {
            self.config_repo_branch = v;
        }
        self
    }
}
