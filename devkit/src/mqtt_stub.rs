/*!
Mock MQTT client pour tests sans broker

Implémente `fleet_common::Publisher` : le kernel et les agents publient
dessus comme sur un vrai `AsyncClient`, les tests inspectent ensuite les
messages enregistrés.
*/

use anyhow::Result;
use fleet_common::{PublishError, Publisher};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Mock MQTT client standing in for `rumqttc::AsyncClient`.
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    offline: Arc<Mutex<bool>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every publish fails like a full request queue.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

impl Publisher for MockMqttClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if *self.offline.lock() {
            return Err(PublishError::Client("mock client offline".into()));
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos: QoS::AtLeastOnce,
        });
        Ok(())
    }
}
