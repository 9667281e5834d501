//! Configuration loading from `~/.gatehouse/config.toml`.

use gatehouse_types::ServiceConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load configuration from disk, falling back to defaults.
///
/// A missing file is normal; an unreadable or malformed one is logged and
/// ignored.
pub fn load_config(path: Option<&Path>) -> ServiceConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return ServiceConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ServiceConfig>(&contents) {
            Ok(config) => {
                info!(
                    path = %config_path.display(),
                    gateways = config.gateways.len(),
                    "Loaded configuration"
                );
                return config;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
        }
    }

    ServiceConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    gatehouse_home().join("config.toml")
}

/// Get the Gatehouse home directory.
pub fn gatehouse_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".gatehouse")
}
