//! MQTT session of a host agent
//!
//! The I/O task owns the connection and the heartbeat timer. Control messages
//! are decoded there and queued to a dedicated converge worker thread, which
//! processes them one at a time and publishes statuses as it goes. Package
//! operations are blocking and stay off the runtime.

use crate::converge::{ConvergeLoop, LoopControl, MqttStatusReporter};
use anyhow::{Context, Result};
use fleet_common::messages::{control_topic, BROADCAST_CONTROL_TOPIC};
use fleet_common::{ControlMessage, Publisher};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive: Duration,
    pub heartbeat_period: Duration,
}

pub struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    control_topic: String,
    heartbeat_period: Duration,
}

impl Session {
    pub fn new(host_id: &str, cfg: &SessionConfig) -> Self {
        let mut opts = MqttOptions::new(
            format!("fleet-agent-{host_id}"),
            cfg.broker_host.clone(),
            cfg.broker_port,
        );
        opts.set_keep_alive(cfg.keep_alive);
        opts.set_clean_session(true);
        let (client, eventloop) = AsyncClient::new(opts, 10);
        Self {
            client,
            eventloop,
            control_topic: control_topic(host_id),
            heartbeat_period: cfg.heartbeat_period,
        }
    }

    /// Runs until the worker stops (exit opcode) or the worker thread dies.
    pub async fn run(mut self, converge: ConvergeLoop) -> Result<()> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (exit_tx, mut exit_rx) = oneshot::channel();
        let publisher: Arc<dyn Publisher> = Arc::new(self.client.clone());
        let worker = spawn_worker(converge, rx, MqttStatusReporter::new(publisher), exit_tx)
            .context("Failed to start converge worker")?;

        let mut heartbeat = interval(self.heartbeat_period);
        info!("Session started, control topic {}", self.control_topic);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(ControlMessage::Heartbeat) {
                        debug!("Converge worker busy, skipping heartbeat");
                    }
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("Connected to broker");
                        self.subscribe();
                    }
                    Ok(Event::Incoming(Incoming::Publish(p)))
                        if p.topic == self.control_topic || p.topic == BROADCAST_CONTROL_TOPIC =>
                    {
                        match serde_json::from_slice::<ControlMessage>(&p.payload) {
                            Ok(msg) => {
                                debug!(opcode = msg.opcode(), "Control message received");
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Invalid control message on {}: {}", p.topic, e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
                _ = &mut exit_rx => {
                    info!("Converge worker stopped");
                    break;
                }
            }
        }

        drop(tx);
        let _ = self.client.try_disconnect();
        tokio::task::spawn_blocking(move || worker.join())
            .await?
            .map_err(|_| anyhow::anyhow!("Converge worker panicked"))
    }

    fn subscribe(&self) {
        for topic in [self.control_topic.as_str(), BROADCAST_CONTROL_TOPIC] {
            if let Err(e) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                error!("Failed to subscribe to {}: {}", topic, e);
            }
        }
    }
}

fn spawn_worker(
    mut converge: ConvergeLoop,
    mut rx: mpsc::Receiver<ControlMessage>,
    mut reporter: MqttStatusReporter,
    exit_tx: oneshot::Sender<()>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("converge".into())
        .spawn(move || {
            while let Some(msg) = rx.blocking_recv() {
                if converge.handle_message(msg, &mut reporter) == LoopControl::Exit {
                    break;
                }
            }
            let _ = exit_tx.send(());
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{MemoryAppCache, MemoryAppDb};
    use crate::desired_store::DesiredStore;
    use fleet_common::messages::STATUS_TOPIC;
    use fleet_common::PublishError;

    struct Sink(parking_lot::Mutex<Vec<String>>);

    impl Publisher for Sink {
        fn publish(&self, topic: &str, _payload: Vec<u8>) -> Result<(), PublishError> {
            self.0.lock().push(topic.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_worker_drains_queue_and_stops_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let converge = ConvergeLoop::new(
            "h1",
            Box::new(MemoryAppDb::new()),
            Box::new(MemoryAppCache::new()),
            DesiredStore::new(dir.path(), "h1"),
            3,
        )
        .allow_exit(true);
        let sink = Arc::new(Sink(parking_lot::Mutex::new(Vec::new())));
        let (tx, rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel();

        let worker = spawn_worker(converge, rx, MqttStatusReporter::new(sink.clone()), exit_tx).unwrap();
        tx.blocking_send(ControlMessage::Ping).unwrap();
        tx.blocking_send(ControlMessage::Exit).unwrap();
        worker.join().unwrap();

        assert!(exit_rx.blocking_recv().is_ok());
        assert_eq!(*sink.0.lock(), vec![STATUS_TOPIC.to_string()]);
    }
}
