use serde::Deserialize;
use std::path::PathBuf;
use tubular_core::config::ConfigType;

const DEFAULT_CONTROLLER_CONFIG: &str = include_str!("./default_controller_config.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub log_level: String,
    pub bind_address: String,
    pub workspace: String,
    pub config_repo_url: String,
    pub config_repo_branch: String,
    pub default_branch: String,
}

impl ConfigType for ControllerConfig {
    fn default_config() -> &'static str {
        DEFAULT_CONTROLLER_CONFIG
    }

    fn config_paths() -> Vec<PathBuf> {
        vec![PathBuf::from("/etc/tubular/tubular.toml")]
    }

    fn env_prefix() -> &'static str {
        "TUBULAR_"
    }
}

impl ControllerConfig {
    /// Honors the bare `TUBULAR_PORT`/`TUBULAR_HOST` env vars from spec.md §6 as
    /// overrides layered on top of the figment-resolved config.
    pub fn apply_legacy_env(mut self) -> Self {
        let host = std::env::var("TUBULAR_HOST").ok();
        let port = std::env::var("TUBULAR_PORT").ok();
        if host.is_some() || port.is_some() {
            let (cur_host, cur_port) = self
                .bind_address
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .unwrap_or_else(|| (self.bind_address.clone(), "8810".to_string()));
            self.bind_address = format!("{}:{}", host.unwrap_or(cur_host), port.unwrap_or(cur_port));
        }
        self
    }
}
