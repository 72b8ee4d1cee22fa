//! Agent configuration
//!
//! Handles:
//! - MQTT broker settings
//! - Host identity and data directory
//! - Convergence limits (attempts, heartbeat period)
//! - App backend selection
//!
//! Stored as TOML at `$FLEET_AGENT_CONFIG` or the OS config directory.

use crate::apps::system::PackageFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub agent: AgentSection,
    pub converge: ConvergeConfig,
    pub apps: AppsBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Overrides the persisted host id.
    pub host_id: Option<String>,
    pub data_dir: PathBuf,
    pub allow_exit_opcode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    pub max_attempts: u32,
    pub heartbeat_period_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    System,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppsBackendConfig {
    pub backend: Backend,
    pub package_prefix: String,
    pub package_format: PackageFormat,
    pub config_script_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub command_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            keep_alive_secs: 60,
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            host_id: None,
            data_dir: PathBuf::from("/var/lib/fleet-agent"),
            allow_exit_opcode: false,
        }
    }
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            heartbeat_period_secs: 60,
        }
    }
}

impl Default for AppsBackendConfig {
    fn default() -> Self {
        Self {
            backend: Backend::System,
            package_prefix: "fleet-".to_string(),
            package_format: PackageFormat::Auto,
            config_script_dir: PathBuf::from("/opt/fleet"),
            cache_dir: PathBuf::from("/var/cache/fleet-agent"),
            command_timeout_secs: 300,
        }
    }
}

impl AgentConfig {
    /// Load config from `$FLEET_AGENT_CONFIG` or the OS-specific location.
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        Self::load_from(&config_path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("FLEET_AGENT_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fleet-agent");
        path.push("config.toml");
        Ok(path)
    }
}
