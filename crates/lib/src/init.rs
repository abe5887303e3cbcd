//! Initialize the configuration directory with a default `config.json`.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;

/// Create the config directory and write the default config if the file does not exist.
/// Returns true when a new file was written.
pub fn init_config(config_path: &Path) -> Result<bool> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
        return Ok(false);
    }
    let json = serde_json::to_string_pretty(&Config::default()).context("serializing default config")?;
    std::fs::write(config_path, json)
        .with_context(|| format!("writing default config to {}", config_path.display()))?;
    log::info!("created default config at {}", config_path.display());
    Ok(true)
}
