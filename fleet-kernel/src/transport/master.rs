/**
 * CONFIG MASTER - Maître de configuration côté kernel
 *
 * RÔLE : Garde le dernier statut reçu de chaque hôte et la config désirée
 * que le kernel veut lui voir appliquer ; envoie `set_config` quand l'hôte
 * s'en écarte.
 *
 * RÈGLE D'ENVOI :
 * - `push_config` envoie toujours à un hôte qui a déjà répondu (l'agent
 *   repart de zéro sur ses tentatives)
 * - à la réception d'un statut, renvoi seulement si l'hôte est `ok` sans
 *   satisfaire la config désirée, ou s'il converge (ou a échoué) vers une
 *   cible périmée. Un hôte en échec sur la bonne cible ne reçoit rien.
 *
 * Sans publisher, le maître sert de transport purement en mémoire (tests).
 */

use super::{ConfigTransport, TransportError};
use fleet_common::messages::{control_topic, BROADCAST_CONTROL_TOPIC};
use fleet_common::{
    is_satisfied_by, parse_apps_config, publish_json, AppsConfig, ControlMessage, HostStatus,
    HostStatusKind, Publisher,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct HostEntry {
    status: HostStatus,
    desired: Option<AppsConfig>,
}

#[derive(Default)]
pub struct ConfigMaster {
    hosts: Mutex<BTreeMap<String, HostEntry>>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl ConfigMaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            hosts: Mutex::new(BTreeMap::new()),
            publisher: Some(publisher),
        }
    }

    /// Records a status report and nudges the host if it drifted.
    pub fn ingest_status(&self, status: HostStatus) -> Result<(), TransportError> {
        let host_id = status.host_id.clone();
        let to_send = {
            let mut hosts = self.hosts.lock();
            let entry = hosts.entry(host_id.clone()).or_insert_with(|| {
                info!(host_id = %host_id, "[master] new host reporting");
                HostEntry {
                    status: status.clone(),
                    desired: None,
                }
            });
            entry.status = status;
            needs_set_config(&entry.status, entry.desired.as_ref()).then(|| entry.desired.clone())
        };
        match to_send.flatten() {
            Some(desired) => self.send_set_config(&host_id, &desired),
            None => Ok(()),
        }
    }

    pub fn desired_apps(&self, host_id: &str) -> Option<AppsConfig> {
        self.hosts.lock().get(host_id)?.desired.clone()
    }

    /// Raw JSON entry point: a malformed value is rejected and the previous
    /// desired config stays in place.
    pub fn set_host_apps_value(&self, host_id: &str, value: &Value) -> Result<(), TransportError> {
        let apps = parse_apps_config(value).inspect_err(|e| {
            warn!(host_id, "[master] rejecting desired config: {}", e);
        })?;
        self.push_config(host_id, &apps)
    }

    pub fn ping_all(&self) -> Result<(), TransportError> {
        if let Some(publisher) = &self.publisher {
            publish_json(publisher.as_ref(), BROADCAST_CONTROL_TOPIC, &ControlMessage::Ping)?;
            debug!("[master] broadcast ping");
        }
        Ok(())
    }

    fn send_set_config(&self, host_id: &str, desired: &AppsConfig) -> Result<(), TransportError> {
        let Some(publisher) = &self.publisher else {
            return Ok(());
        };
        let data = serde_json::to_value(desired).map_err(fleet_common::PublishError::from)?;
        publish_json(
            publisher.as_ref(),
            &control_topic(host_id),
            &ControlMessage::SetConfig { data },
        )?;
        info!(host_id, apps = desired.len(), "[master] set_config sent");
        Ok(())
    }
}

fn needs_set_config(status: &HostStatus, desired: Option<&AppsConfig>) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    match status.status {
        HostStatusKind::Ok => !is_satisfied_by(Some(desired), &status.apps),
        HostStatusKind::Missing => false,
        _ => status
            .desired_apps
            .as_ref()
            .is_some_and(|target| !is_satisfied_by(Some(desired), target)),
    }
}

impl ConfigTransport for ConfigMaster {
    fn list_host_ids(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.hosts.lock().keys().cloned().collect())
    }

    fn get_host_status(&self, host_id: &str) -> Result<Option<HostStatus>, TransportError> {
        Ok(self.hosts.lock().get(host_id).map(|e| e.status.clone()))
    }

    fn push_config(&self, host_id: &str, apps: &AppsConfig) -> Result<(), TransportError> {
        let send = {
            let mut hosts = self.hosts.lock();
            let entry = hosts.entry(host_id.to_string()).or_insert_with(|| {
                warn!(host_id, "[master] push to unknown host, adding placeholder");
                HostEntry {
                    status: HostStatus::missing(host_id),
                    desired: None,
                }
            });
            entry.desired = Some(apps.clone());
            entry.status.status != HostStatusKind::Missing
        };
        if send {
            self.send_set_config(host_id, apps)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{AppSpec, PublishError};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Value)>>);

    impl Publisher for Recorder {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            let value = serde_json::from_slice(&payload)?;
            self.0.lock().push((topic.to_string(), value));
            Ok(())
        }
    }

    fn foo(version: &str) -> AppsConfig {
        [("foo".to_string(), AppSpec::new(version).with_running(true))].into()
    }

    fn status(kind: HostStatusKind, apps: AppsConfig, desired: Option<AppsConfig>) -> HostStatus {
        HostStatus::new("h1", kind, apps).with_desired(desired)
    }

    fn master() -> (ConfigMaster, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        (ConfigMaster::with_publisher(rec.clone()), rec)
    }

    #[test]
    fn test_push_to_unknown_host_creates_missing_placeholder() {
        let (master, rec) = master();
        master.push_config("h1", &foo("1.0")).unwrap();

        let st = master.get_host_status("h1").unwrap().unwrap();
        assert_eq!(st.status, HostStatusKind::Missing);
        assert_eq!(st.timestamp, time::OffsetDateTime::UNIX_EPOCH);
        assert!(rec.0.lock().is_empty());
        assert_eq!(master.list_host_ids().unwrap(), vec!["h1".to_string()]);
    }

    #[test]
    fn test_ok_host_out_of_sync_gets_set_config() {
        let (master, rec) = master();
        master.ingest_status(status(HostStatusKind::Ok, AppsConfig::new(), None)).unwrap();
        master.push_config("h1", &foo("1.0")).unwrap();

        let sent = rec.0.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "fleet/hosts/control@v1/h1");
        assert_eq!(sent[0].1["opcode"], json!("set_config"));
        assert_eq!(sent[0].1["data"]["foo"]["version"], json!("1.0"));

        // satisfied status: no re-send, but an explicit push always goes out
        master.ingest_status(status(HostStatusKind::Ok, foo("1.0"), None)).unwrap();
        assert_eq!(rec.0.lock().len(), 1);
        master.push_config("h1", &foo("1.0")).unwrap();
        assert_eq!(rec.0.lock().len(), 2);
    }

    #[test]
    fn test_failed_on_current_target_is_left_alone() {
        // pushed before the host ever reported: stored only
        let (master, rec) = master();
        master.push_config("h1", &foo("1.0")).unwrap();
        master
            .ingest_status(status(HostStatusKind::Failed, AppsConfig::new(), Some(foo("1.0"))))
            .unwrap();
        assert!(rec.0.lock().is_empty());

        // converging towards an outdated target
        master
            .ingest_status(status(HostStatusKind::Converging, AppsConfig::new(), Some(foo("0.9"))))
            .unwrap();
        assert_eq!(rec.0.lock().len(), 1);
    }

    #[test]
    fn test_malformed_value_keeps_previous_desired() {
        let (master, _rec) = master();
        master.push_config("h1", &foo("1.0")).unwrap();
        let err = master.set_host_apps_value("h1", &json!("garbage")).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
        assert_eq!(master.desired_apps("h1"), Some(foo("1.0")));

        master.set_host_apps_value("h1", &json!({})).unwrap();
        assert_eq!(master.desired_apps("h1"), Some(AppsConfig::new()));
    }

    #[test]
    fn test_ping_all_broadcasts() {
        let (master, rec) = master();
        master.ping_all().unwrap();
        assert_eq!(
            rec.0.lock().clone(),
            vec![(BROADCAST_CONTROL_TOPIC.to_string(), json!({"opcode": "ping"}))]
        );
    }
}
