// Configuration management for the swarmnet CLI
//
// Stored as JSON in the platform config directory:
// - macOS / Linux: ~/.config/swarmnet/config.json
// - Windows: %APPDATA%\swarmnet\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use swarmnet_core::{IceServerConfig, NetworkConfig, NetworkManagerOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling server websocket URLs
    pub signal_servers: Vec<String>,

    /// STUN/TURN servers handed to WebRTC
    pub ice_servers: Vec<IceServerConfig>,

    /// Port used by `swarmnet serve` when none is given
    pub listen_port: u16,

    /// Directory for log files; logs go to stderr only when unset
    pub log_dir: Option<String>,

    /// Timing knobs of the networking stack
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal_servers: vec!["ws://127.0.0.1:9000".to_string()],
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            listen_port: 9000,
            log_dir: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("swarmnet");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Options for a websocket-signaled network manager
    pub fn manager_options(&self, signal_override: &[String]) -> NetworkManagerOptions {
        let signal = if signal_override.is_empty() {
            self.signal_servers.clone()
        } else {
            signal_override.to_vec()
        };
        NetworkManagerOptions {
            signal,
            ice: self.ice_servers.clone(),
            log: false,
            timing: self.network.clone(),
        }
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "signal_servers" => {
                self.signal_servers = split_list(value);
            }
            "ice_servers" => {
                self.ice_servers = split_list(value)
                    .into_iter()
                    .map(IceServerConfig::stun)
                    .collect();
            }
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "offer_timeout_ms" => {
                self.network.offer_timeout_ms = value.parse().context("Invalid number")?;
            }
            "connect_timeout_ms" => {
                self.network.connect_timeout_ms = value.parse().context("Invalid number")?;
            }
            "retry_interval_ms" => {
                self.network.router.retry_interval_ms = value.parse().context("Invalid number")?;
            }
            "retry_timeout_ms" => {
                self.network.router.retry_timeout_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let ice: Vec<String> = self
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter().cloned())
            .collect();
        vec![
            ("signal_servers".to_string(), self.signal_servers.join(",")),
            ("ice_servers".to_string(), ice.join(",")),
            ("listen_port".to_string(), self.listen_port.to_string()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            (
                "offer_timeout_ms".to_string(),
                self.network.offer_timeout_ms.to_string(),
            ),
            (
                "connect_timeout_ms".to_string(),
                self.network.connect_timeout_ms.to_string(),
            ),
            (
                "retry_interval_ms".to_string(),
                self.network.router.retry_interval_ms.to_string(),
            ),
            (
                "retry_timeout_ms".to_string(),
                self.network.router.retry_timeout_ms.to_string(),
            ),
        ]
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
