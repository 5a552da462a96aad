// Configuration management for the callmatch CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/callmatch/config.json
// - Linux: ~/.config/callmatch/config.json
// - Windows: %APPDATA%\callmatch\config.json

use anyhow::{Context, Result};
use callmatch_core::RendezvousConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port for the HTTP/WebSocket server
    pub listen_port: u16,

    /// Shared peer directory (sled path); None keeps discovery in-process
    pub directory_path: Option<String>,

    /// Name this node writes into directory records
    pub node_name: String,

    /// Write logs here instead of stderr
    pub log_dir: Option<String>,

    /// Matchmaking and session tunables
    pub rendezvous: RendezvousConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 9000,
            directory_path: None,
            node_name: "callmatch-node".to_string(),
            log_dir: None,
            rendezvous: RendezvousConfig::default(),
        }
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("callmatch");

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
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
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

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory, rejecting values the coordinator
    /// would refuse to run with
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        let rv = &mut next.rendezvous;
        match key {
            "listen_port" => next.listen_port = value.parse().context("Invalid port number")?,
            "directory_path" => next.directory_path = optional(value),
            "node_name" => {
                if value.is_empty() {
                    anyhow::bail!("node_name cannot be empty");
                }
                next.node_name = value.to_string();
            }
            "log_dir" => next.log_dir = optional(value),
            "negotiation_timeout_ms" => {
                rv.negotiation_timeout_ms = value.parse().context("Invalid number")?
            }
            "queue_wait_timeout_ms" => {
                rv.queue_wait_timeout_ms = value.parse().context("Invalid number")?
            }
            "peer_liveness_timeout_ms" => {
                rv.peer_liveness_timeout_ms = value.parse().context("Invalid number")?
            }
            "session_retention_ms" => {
                rv.session_retention_ms = value.parse().context("Invalid number")?
            }
            "sweep_interval_ms" => rv.sweep_interval_ms = value.parse().context("Invalid number")?,
            "max_pending_signals" => {
                rv.max_pending_signals = value.parse().context("Invalid number")?
            }
            "max_chat_text_len" => rv.max_chat_text_len = value.parse().context("Invalid number")?,
            "requeue_after_session" => {
                rv.requeue_after_session = value.parse().context("Invalid boolean value")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        next.rendezvous
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e))?;
        *self = next;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let rv = &self.rendezvous;
        vec![
            ("listen_port".to_string(), self.listen_port.to_string()),
            (
                "directory_path".to_string(),
                self.directory_path.clone().unwrap_or_default(),
            ),
            ("node_name".to_string(), self.node_name.clone()),
            ("log_dir".to_string(), self.log_dir.clone().unwrap_or_default()),
            ("negotiation_timeout_ms".to_string(), rv.negotiation_timeout_ms.to_string()),
            ("queue_wait_timeout_ms".to_string(), rv.queue_wait_timeout_ms.to_string()),
            ("peer_liveness_timeout_ms".to_string(), rv.peer_liveness_timeout_ms.to_string()),
            ("session_retention_ms".to_string(), rv.session_retention_ms.to_string()),
            ("sweep_interval_ms".to_string(), rv.sweep_interval_ms.to_string()),
            ("max_pending_signals".to_string(), rv.max_pending_signals.to_string()),
            ("max_chat_text_len".to_string(), rv.max_chat_text_len.to_string()),
            ("requeue_after_session".to_string(), rv.requeue_after_session.to_string()),
        ]
    }
}
