//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.device-forwarder/config.json`) and environment.
//! Every field has a default, so a missing file or `{}` is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Control socket settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Device-side listener settings.
    #[serde(default)]
    pub listener: ListenerConfig,
}

/// Rendezvous socket and command handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Unix socket path the host connects to. Overridden by DEVICE_FORWARDER_SOCKET env.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// How long a control connection may take to deliver its command frame (default 5000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Address forwarded ports are bound on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Bind address for device-side listeners (default "127.0.0.1").
    #[serde(default = "default_listener_bind")]
    pub bind: String,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/device_forwarder.sock")
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_listener_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_listener_bind(),
        }
    }
}

impl ControllerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl ListenerConfig {
    /// Parse the bind address. `localhost` is accepted as an alias for 127.0.0.1.
    pub fn bind_addr(&self) -> Result<IpAddr> {
        let b = self.bind.trim();
        if b.eq_ignore_ascii_case("localhost") {
            return Ok(IpAddr::from([127, 0, 0, 1]));
        }
        b.parse()
            .with_context(|| format!("parsing listener bind address {:?}", b))
    }
}

/// Resolve the control socket path: env DEVICE_FORWARDER_SOCKET overrides config.
pub fn resolve_socket_path(config: &Config) -> PathBuf {
    std::env::var("DEVICE_FORWARDER_SOCKET")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| config.controller.socket_path.clone())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DEVICE_FORWARDER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".device-forwarder").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, else DEVICE_FORWARDER_CONFIG, else the default path.
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.controller.socket_path, PathBuf::from("/tmp/device_forwarder.sock"));
        assert_eq!(c.controller.command_timeout(), Duration::from_secs(5));
        assert_eq!(c.listener.bind, "127.0.0.1");
    }

    #[test]
    fn empty_json_uses_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.controller.command_timeout_ms, 5000);
        assert_eq!(c.listener.bind, "127.0.0.1");
    }

    #[test]
    fn camel_case_fields() {
        let c: Config = serde_json::from_str(
            r#"{"controller":{"socketPath":"/data/local/tmp/fwd","commandTimeoutMs":250},"listener":{"bind":"0.0.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(c.controller.socket_path, PathBuf::from("/data/local/tmp/fwd"));
        assert_eq!(c.controller.command_timeout(), Duration::from_millis(250));
        assert_eq!(c.listener.bind_addr().unwrap(), IpAddr::from([0, 0, 0, 0]));
    }

    #[test]
    fn bind_addr_localhost_and_invalid() {
        let mut l = ListenerConfig::default();
        l.bind = "localhost".to_string();
        assert_eq!(l.bind_addr().unwrap(), IpAddr::from([127, 0, 0, 1]));
        l.bind = "not an address".to_string();
        assert!(l.bind_addr().is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("device-forwarder-missing-config-test.json");
        let _ = std::fs::remove_file(&path);
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.listener.bind, "127.0.0.1");
    }
}
