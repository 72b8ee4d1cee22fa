/**
 * ROLE STORE - Persistance des associations (hôte, rôle) et des hôtes
 *
 * RÔLE : Table des associations indexée par (host_id, role_name) avec l'état
 * courant, et lignes hôtes avec métadonnées de réactivité (responding,
 * last_status_time, last_push_time).
 *
 * IMPLÉMENTATIONS :
 * - MemoryRoleStore : tests et exécution sans disque
 * - JsonRoleStore : fichier JSON complet réécrit à chaque modification.
 *   La modification est appliquée sur une copie, écrite, puis publiée :
 *   une écriture ratée laisse l'état en mémoire inchangé.
 */

use crate::role_states::RoleState;
use fleet_common::{HostInfo, HostStatusKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Version/params requested by add_role, committed once `on_auth` passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleChange {
    pub role_version: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssociation {
    pub host_id: String,
    pub role_name: String,
    pub role_version: String,
    pub current_state: RoleState,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<RoleChange>,
    /// State the deauth started from; a failed `on_deauth` returns there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deauth_from: Option<RoleState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_id: String,
    pub responding: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_status_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_push_time: Option<OffsetDateTime>,
    /// Last status the host agent reported.
    #[serde(default)]
    pub role_status: Option<HostStatusKind>,
    #[serde(default)]
    pub info: Option<HostInfo>,
}

impl HostRecord {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            responding: true,
            last_status_time: None,
            last_push_time: None,
            role_status: None,
            info: None,
        }
    }
}

pub trait RoleStore: Send + Sync {
    fn get_association(&self, host_id: &str, role: &str) -> Result<Option<RoleAssociation>, StoreError>;
    fn associations_for_host(&self, host_id: &str) -> Result<Vec<RoleAssociation>, StoreError>;
    fn list_associations(&self) -> Result<Vec<RoleAssociation>, StoreError>;
    fn put_association(&self, assoc: &RoleAssociation) -> Result<(), StoreError>;
    fn delete_association(&self, host_id: &str, role: &str) -> Result<(), StoreError>;

    fn get_host(&self, host_id: &str) -> Result<Option<HostRecord>, StoreError>;
    fn list_hosts(&self) -> Result<Vec<HostRecord>, StoreError>;
    fn put_host(&self, host: &HostRecord) -> Result<(), StoreError>;
    fn delete_host(&self, host_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    associations: BTreeMap<String, BTreeMap<String, RoleAssociation>>,
    #[serde(default)]
    hosts: BTreeMap<String, HostRecord>,
}

impl StoreData {
    fn association(&self, host_id: &str, role: &str) -> Option<RoleAssociation> {
        self.associations.get(host_id)?.get(role).cloned()
    }

    fn for_host(&self, host_id: &str) -> Vec<RoleAssociation> {
        self.associations
            .get(host_id)
            .map(|roles| roles.values().cloned().collect())
            .unwrap_or_default()
    }

    fn all(&self) -> Vec<RoleAssociation> {
        self.associations.values().flat_map(|r| r.values().cloned()).collect()
    }

    fn put(&mut self, assoc: &RoleAssociation) {
        self.associations
            .entry(assoc.host_id.clone())
            .or_default()
            .insert(assoc.role_name.clone(), assoc.clone());
    }

    fn remove(&mut self, host_id: &str, role: &str) {
        if let Some(roles) = self.associations.get_mut(host_id) {
            roles.remove(role);
            if roles.is_empty() {
                self.associations.remove(host_id);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRoleStore {
    data: Mutex<StoreData>,
}

impl MemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoleStore for MemoryRoleStore {
    fn get_association(&self, host_id: &str, role: &str) -> Result<Option<RoleAssociation>, StoreError> {
        Ok(self.data.lock().association(host_id, role))
    }

    fn associations_for_host(&self, host_id: &str) -> Result<Vec<RoleAssociation>, StoreError> {
        Ok(self.data.lock().for_host(host_id))
    }

    fn list_associations(&self) -> Result<Vec<RoleAssociation>, StoreError> {
        Ok(self.data.lock().all())
    }

    fn put_association(&self, assoc: &RoleAssociation) -> Result<(), StoreError> {
        self.data.lock().put(assoc);
        Ok(())
    }

    fn delete_association(&self, host_id: &str, role: &str) -> Result<(), StoreError> {
        self.data.lock().remove(host_id, role);
        Ok(())
    }

    fn get_host(&self, host_id: &str) -> Result<Option<HostRecord>, StoreError> {
        Ok(self.data.lock().hosts.get(host_id).cloned())
    }

    fn list_hosts(&self) -> Result<Vec<HostRecord>, StoreError> {
        Ok(self.data.lock().hosts.values().cloned().collect())
    }

    fn put_host(&self, host: &HostRecord) -> Result<(), StoreError> {
        self.data.lock().hosts.insert(host.host_id.clone(), host.clone());
        Ok(())
    }

    fn delete_host(&self, host_id: &str) -> Result<(), StoreError> {
        self.data.lock().hosts.remove(host_id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct JsonRoleStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonRoleStore {
    /// Loads the file when present, starts empty otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let data: StoreData = serde_json::from_str(&content)?;
            info!(
                "[store] loaded {} hosts, {} role associations from {}",
                data.hosts.len(),
                data.all().len(),
                path.display()
            );
            data
        } else {
            info!("[store] no existing store at {}, starting fresh", path.display());
            StoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn commit<F: FnOnce(&mut StoreData)>(&self, change: F) -> Result<(), StoreError> {
        let mut guard = self.data.lock();
        let mut next = guard.clone();
        change(&mut next);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&next)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;

        *guard = next;
        Ok(())
    }
}

impl RoleStore for JsonRoleStore {
    fn get_association(&self, host_id: &str, role: &str) -> Result<Option<RoleAssociation>, StoreError> {
        Ok(self.data.lock().association(host_id, role))
    }

    fn associations_for_host(&self, host_id: &str) -> Result<Vec<RoleAssociation>, StoreError> {
        Ok(self.data.lock().for_host(host_id))
    }

    fn list_associations(&self) -> Result<Vec<RoleAssociation>, StoreError> {
        Ok(self.data.lock().all())
    }

    fn put_association(&self, assoc: &RoleAssociation) -> Result<(), StoreError> {
        self.commit(|d| d.put(assoc))
    }

    fn delete_association(&self, host_id: &str, role: &str) -> Result<(), StoreError> {
        self.commit(|d| d.remove(host_id, role))
    }

    fn get_host(&self, host_id: &str) -> Result<Option<HostRecord>, StoreError> {
        Ok(self.data.lock().hosts.get(host_id).cloned())
    }

    fn list_hosts(&self) -> Result<Vec<HostRecord>, StoreError> {
        Ok(self.data.lock().hosts.values().cloned().collect())
    }

    fn put_host(&self, host: &HostRecord) -> Result<(), StoreError> {
        self.commit(|d| {
            d.hosts.insert(host.host_id.clone(), host.clone());
        })
    }

    fn delete_host(&self, host_id: &str) -> Result<(), StoreError> {
        self.commit(|d| {
            d.hosts.remove(host_id);
        })
    }
}
