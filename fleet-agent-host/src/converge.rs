//! Host-side convergence loop
//!
//! Handles one control message at a time:
//! - `set_config` installs a new target and resets the attempt counter
//! - `ping` / `heartbeat` re-evaluate the cached target (or adopt the current
//!   state when there is none)
//! - the target is persisted before anything is changed on the system
//! - after `max_attempts` unsuccessful attempts the loop reports `failed` and
//!   stops converging until a new `set_config` arrives

use crate::apps::{current_config, AppCache, AppDb};
use crate::desired_store::DesiredStore;
use crate::engine::{process_apps, ConvergeOptions};
use fleet_common::messages::STATUS_TOPIC;
use fleet_common::{
    parse_apps_config, publish_json, AgentMessage, AppsConfig, ControlMessage, HostInfo,
    HostStatus, HostStatusKind, Publisher,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Where status updates go.
pub trait StatusReporter {
    fn report(&mut self, status: HostStatus);
}

impl StatusReporter for Vec<HostStatus> {
    fn report(&mut self, status: HostStatus) {
        self.push(status);
    }
}

/// Publishes each status as soon as it is produced.
pub struct MqttStatusReporter {
    publisher: Arc<dyn Publisher>,
}

impl MqttStatusReporter {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

impl StatusReporter for MqttStatusReporter {
    fn report(&mut self, status: HostStatus) {
        let kind = status.status;
        let msg = AgentMessage::Status { data: status };
        if let Err(e) = publish_json(self.publisher.as_ref(), STATUS_TOPIC, &msg) {
            error!("Failed to publish {} status: {}", kind, e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

pub struct ConvergeLoop {
    host_id: String,
    db: Box<dyn AppDb>,
    cache: Box<dyn AppCache>,
    store: DesiredStore,
    desired: Option<AppsConfig>,
    attempts: u32,
    max_attempts: u32,
    info: Option<HostInfo>,
    allow_exit: bool,
}

impl ConvergeLoop {
    /// Picks up the target cached by a previous run, if any.
    pub fn new(
        host_id: impl Into<String>,
        db: Box<dyn AppDb>,
        cache: Box<dyn AppCache>,
        store: DesiredStore,
        max_attempts: u32,
    ) -> Self {
        let desired = match store.load() {
            Ok(desired) => desired,
            Err(e) => {
                warn!("Ignoring cached desired config at {}: {}", store.path().display(), e);
                None
            }
        };
        if desired.is_some() {
            info!("Resuming convergence towards cached desired config");
        }
        Self {
            host_id: host_id.into(),
            db,
            cache,
            store,
            desired,
            attempts: 0,
            max_attempts,
            info: None,
            allow_exit: false,
        }
    }

    pub fn with_host_info(mut self, info: HostInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn allow_exit(mut self, allow: bool) -> Self {
        self.allow_exit = allow;
        self
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn desired(&self) -> Option<&AppsConfig> {
        self.desired.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn handle_message(
        &mut self,
        msg: ControlMessage,
        reporter: &mut dyn StatusReporter,
    ) -> LoopControl {
        match msg {
            ControlMessage::Exit if self.allow_exit => {
                info!("Exit requested by kernel");
                return LoopControl::Exit;
            }
            ControlMessage::Exit => {
                warn!("Ignoring exit opcode (not allowed by configuration)");
                return LoopControl::Continue;
            }
            ControlMessage::SetConfig { data } => match parse_apps_config(&data) {
                Ok(desired) => {
                    info!(apps = desired.len(), "New desired config received");
                    self.desired = Some(desired);
                    self.attempts = 0;
                }
                Err(e) => {
                    warn!("Discarding malformed set_config: {}", e);
                    return LoopControl::Continue;
                }
            },
            ControlMessage::Ping | ControlMessage::Heartbeat => {}
        }

        let current = match current_config(self.db.as_ref()) {
            Ok(current) => current,
            Err(e) => {
                error!("Failed to query installed apps: {}", e);
                return LoopControl::Continue;
            }
        };
        let desired = self.desired.get_or_insert_with(|| current.clone()).clone();

        if let Err(e) = self.store.save(Some(&desired)) {
            error!("Failed to persist desired config, skipping convergence: {}", e);
            return LoopControl::Continue;
        }

        if self.is_converged(&desired) {
            reporter.report(self.status(HostStatusKind::Ok, current, None));
            return LoopControl::Continue;
        }

        if self.attempts >= self.max_attempts {
            reporter.report(self.status(HostStatusKind::Failed, current, Some(desired)));
            return LoopControl::Continue;
        }

        reporter.report(self.status(HostStatusKind::Converging, current, Some(desired.clone())));
        self.attempts += 1;
        info!(attempt = self.attempts, max = self.max_attempts, "Converging");
        if let Err(e) = process_apps(
            self.db.as_ref(),
            self.cache.as_ref(),
            &desired,
            ConvergeOptions::default(),
        ) {
            error!(attempt = self.attempts, "Convergence attempt failed: {}", e);
        }

        let current = match current_config(self.db.as_ref()) {
            Ok(current) => current,
            Err(e) => {
                error!("Failed to query installed apps after convergence: {}", e);
                return LoopControl::Continue;
            }
        };

        if self.is_converged(&desired) {
            info!(attempts = self.attempts, "Converged");
            self.desired = None;
            if let Err(e) = self.store.save(None) {
                error!("Failed to clear cached desired config: {}", e);
            }
            reporter.report(self.status(HostStatusKind::Ok, current, None));
        } else if self.attempts >= self.max_attempts {
            error!("Entering failed state after {} converge attempts", self.attempts);
            reporter.report(self.status(HostStatusKind::Failed, current, Some(desired)));
        } else {
            reporter.report(self.status(HostStatusKind::Retrying, current, Some(desired)));
        }
        LoopControl::Continue
    }

    fn is_converged(&self, desired: &AppsConfig) -> bool {
        match process_apps(
            self.db.as_ref(),
            self.cache.as_ref(),
            desired,
            ConvergeOptions::probe(),
        ) {
            Ok(changes) => changes == 0,
            Err(e) => {
                warn!("Probe failed, assuming not converged: {}", e);
                false
            }
        }
    }

    fn status(
        &self,
        kind: HostStatusKind,
        apps: AppsConfig,
        desired: Option<AppsConfig>,
    ) -> HostStatus {
        HostStatus::new(self.host_id.clone(), kind, apps)
            .with_desired(desired)
            .with_info(self.info.clone())
    }
}
