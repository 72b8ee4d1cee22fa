/**
 * CONFIG TRANSPORT - Canal entre le kernel et les agents des hôtes
 *
 * RÔLE : Interface unique (lister les hôtes, lire leur statut, pousser une
 * config désirée) utilisée par la machine d'états et le poller.
 * Les appels sont synchrones ; un échec n'altère jamais l'état engagé.
 *
 * IMPLÉMENTATIONS :
 * - master::ConfigMaster : maître de configuration en mémoire, branché ou non sur MQTT
 * - mqtt::spawn_status_listener : alimente le maître avec les statuts reçus
 */

pub mod master;
pub mod mqtt;

use fleet_common::{AppsConfig, ConfigError, HostStatus, PublishError};

pub use master::ConfigMaster;
pub use mqtt::{create_mqtt_client, spawn_status_listener};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

pub trait ConfigTransport: Send + Sync {
    fn list_host_ids(&self) -> Result<Vec<String>, TransportError>;
    fn get_host_status(&self, host_id: &str) -> Result<Option<HostStatus>, TransportError>;
    fn push_config(&self, host_id: &str, apps: &AppsConfig) -> Result<(), TransportError>;
}
