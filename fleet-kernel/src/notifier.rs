/**
 * NOTIFIER - Notifications de changement best-effort
 *
 * RÔLE : Signale chaque changement d'état d'un hôte ou d'un rôle
 * (change_type, object_type, object_id). Fire-and-forget : un échec est
 * journalisé, jamais propagé.
 */

use fleet_common::messages::CHANGES_TOPIC;
use fleet_common::{publish_json, Publisher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,
    pub change_type: String,
    pub object_type: String,
    pub object_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, change_type: &str, object_type: &str, object_id: &str);
}

pub struct NullNotifier;

impl ChangeNotifier for NullNotifier {
    fn publish(&self, _change_type: &str, _object_type: &str, _object_id: &str) {}
}

pub struct MqttNotifier {
    publisher: Arc<dyn Publisher>,
}

impl MqttNotifier {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

impl ChangeNotifier for MqttNotifier {
    fn publish(&self, change_type: &str, object_type: &str, object_id: &str) {
        let event = ChangeEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            change_type: change_type.to_string(),
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        };
        if let Err(e) = publish_json(self.publisher.as_ref(), CHANGES_TOPIC, &event) {
            warn!("[notifier] dropped {change_type} {object_type}/{object_id}: {e}");
        }
    }
}
