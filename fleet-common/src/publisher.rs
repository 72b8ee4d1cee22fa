use crate::error::PublishError;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::debug;

/// Fire-and-forget message sink. Implemented by the real MQTT client and by
/// test doubles, so nothing downstream needs a live broker.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        // try_publish queues on the event loop without awaiting, usable from worker threads
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| PublishError::Client(e.to_string()))
    }
}

pub fn publish_json<T: Serialize>(
    publisher: &dyn Publisher,
    topic: &str,
    message: &T,
) -> Result<(), PublishError> {
    let payload = serde_json::to_vec(message)?;
    debug!(topic, bytes = payload.len(), "publishing");
    publisher.publish(topic, payload)
}
