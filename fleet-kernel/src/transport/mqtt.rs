use super::master::ConfigMaster;
use crate::config::MqttConf;
use fleet_common::messages::STATUS_TOPIC;
use fleet_common::AgentMessage;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// Drives the kernel's MQTT event loop and feeds agent statuses to the master.
/// On every (re)connect the status topic is subscribed and all agents pinged.
pub fn spawn_status_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    master: Arc<ConfigMaster>,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("[kernel] MQTT connected");
                    if let Err(e) = client.try_subscribe(STATUS_TOPIC, QoS::AtLeastOnce) {
                        error!("[kernel] subscribe MQTT failed: {e:?}");
                    }
                    if let Err(e) = master.ping_all() {
                        warn!("[kernel] ping_all failed: {e}");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == STATUS_TOPIC => {
                    match serde_json::from_slice::<AgentMessage>(&p.payload) {
                        Ok(AgentMessage::Status { data }) => {
                            debug!(host_id = %data.host_id, status = %data.status, "[kernel] status received");
                            if let Err(e) = master.ingest_status(data) {
                                warn!("[kernel] failed to handle status: {e}");
                            }
                        }
                        Err(e) => warn!("[kernel] status JSON invalide: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[kernel] MQTT erreur: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
