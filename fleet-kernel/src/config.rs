use crate::roles::RoleDefinition;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub poller: PollerConf,
    pub storage: StorageConf,
    pub roles: Vec<RoleDefinition>,
    /// host_id -> roles applied at startup
    pub assignments: BTreeMap<String, Vec<Assignment>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "fleet-kernel".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollerConf {
    pub interval_secs: u64,
    /// Max status age while the host reports `ok` / `failed`.
    pub steady_threshold_secs: u64,
    /// Max status age while the host reports `converging` / `retrying`.
    pub converging_threshold_secs: u64,
    pub unauthorized_timeout_secs: u64,
}

impl Default for PollerConf {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            steady_threshold_secs: 150,
            converging_threshold_secs: 900,
            unauthorized_timeout_secs: 600,
        }
    }
}

impl PollerConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub data_dir: PathBuf,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl StorageConf {
    pub fn roles_file(&self) -> PathBuf {
        self.data_dir.join("roles.json")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Assignment {
    pub role: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: impl AsRef<Path>) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!("[kernel] pas de {}, usage config par défaut", path.display());
        return KernelConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!("[kernel] lecture {} impossible: {e}", path.display());
            return KernelConfig::default();
        }
    };
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!("[kernel] config invalide: {e}");
        KernelConfig::default()
    })
}
