use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    /// Flat allow-list of valid API keys. Must be non-empty to start.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Allowed WebSocket origins. "*" permits all; a connection without an
    /// Origin header is always rejected.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: i64,
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: i64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bridge_port() -> u16 {
    8765
}

fn default_rate_limit_window_ms() -> i64 {
    60_000
}

fn default_rate_limit_max_requests() -> u32 {
    100
}

fn default_session_timeout_ms() -> i64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_bridge_host(),
            port: default_bridge_port(),
            api_keys: Vec::new(),
            allowed_origins: Vec::new(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            session_timeout_ms: default_session_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl BridgeConfig {
    /// Startup validation. Configuration errors are fatal, not retried.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("bridge port must be non-zero".to_string()));
        }
        if self.api_keys.is_empty() {
            return Err(Error::Config(
                "at least one API key must be configured".to_string(),
            ));
        }
        if self.api_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(Error::Config("API keys must be non-empty".to_string()));
        }
        Ok(())
    }
}

/// Upstream tool-provider process: spawned once and spoken to over stdio.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
