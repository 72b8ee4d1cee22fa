/*!
Test harness pour le kernel et les agents

- `TestHarness` : machine d'états + poller + maître de config branchés sur
  un `MockMqttClient`, store en mémoire ou fourni
- `SimulatedHost` : vraie `ConvergeLoop` sur `MemoryAppDb`, qui consomme les
  `set_config` publiés pour elle et renvoie ses statuts au maître
- `RecordingNotifier` / `RecordingHook` : enregistrent ce qui passe
*/

use crate::mqtt_stub::MockMqttClient;
use anyhow::{Context, Result};
use fleet_agent_host::apps::memory::{MemoryAppCache, MemoryAppDb};
use fleet_agent_host::desired_store::DesiredStore;
use fleet_agent_host::{ConvergeLoop, LoopControl};
use fleet_common::messages::{control_topic, BROADCAST_CONTROL_TOPIC};
use fleet_common::{ControlMessage, HostStatus, HostStatusKind};
use fleet_kernel::config::PollerConf;
use fleet_kernel::hooks::{HookContext, HookError, HookRegistry, RoleEvent, RoleHook};
use fleet_kernel::notifier::ChangeNotifier;
use fleet_kernel::store::{MemoryRoleStore, RoleStore};
use fleet_kernel::transport::ConfigMaster;
use fleet_kernel::{HostCache, ReconciliationPoller, RoleCatalog, RoleDefinition, RoleState, RoleStateMachine};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// (change_type, object_type, object_id)
pub type ChangeRecord = (String, String, String);

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ChangeRecord>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ChangeRecord> {
        self.events.lock().clone()
    }

    pub fn count(&self, change_type: &str, object_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(c, o, _)| c == change_type && o == object_type)
            .count()
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn publish(&self, change_type: &str, object_type: &str, object_id: &str) {
        log::debug!("🔔 change {} {}/{}", change_type, object_type, object_id);
        self.events
            .lock()
            .push((change_type.into(), object_type.into(), object_id.into()));
    }
}

/// Records (host_id, role, event) for every call; fails while switched on.
#[derive(Default)]
pub struct RecordingHook {
    calls: Mutex<Vec<(String, String, RoleEvent)>>,
    failing: AtomicBool,
}

impl RecordingHook {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, String, RoleEvent)> {
        self.calls.lock().clone()
    }
}

impl RoleHook for RecordingHook {
    fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        self.calls
            .lock()
            .push((ctx.host_id.into(), ctx.role_name.into(), ctx.event));
        if self.failing.load(Ordering::SeqCst) {
            return Err(HookError::Failed(format!("{} hook switched off", ctx.event)));
        }
        Ok(())
    }
}

/// Kernel side wired without a broker.
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub store: Arc<dyn RoleStore>,
    pub master: Arc<ConfigMaster>,
    pub hooks: Arc<HookRegistry>,
    pub notifier: Arc<RecordingNotifier>,
    pub machine: Arc<RoleStateMachine>,
    pub poller: ReconciliationPoller,
}

impl TestHarness {
    pub fn new(roles: Vec<RoleDefinition>) -> Result<Self> {
        Self::with_store(roles, Arc::new(MemoryRoleStore::new()))
    }

    pub fn with_store(roles: Vec<RoleDefinition>, store: Arc<dyn RoleStore>) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let catalog = RoleCatalog::new(roles).context("invalid test catalog")?;
        let hooks = Arc::new(HookRegistry::new());
        for def in catalog.definitions() {
            hooks.register_specs(&def.name, &def.hooks);
        }
        let mqtt_client = MockMqttClient::new();
        let master = Arc::new(ConfigMaster::with_publisher(Arc::new(mqtt_client.clone())));
        let notifier = Arc::new(RecordingNotifier::default());
        let machine = Arc::new(RoleStateMachine::new(
            store.clone(),
            master.clone(),
            Arc::new(catalog),
            hooks.clone(),
            notifier.clone(),
        ));
        let poller = ReconciliationPoller::new(machine.clone(), Arc::new(HostCache::new()), PollerConf::default());

        Ok(Self {
            mqtt_client,
            store,
            master,
            hooks,
            notifier,
            machine,
            poller,
        })
    }

    pub fn with_poller_conf(mut self, conf: PollerConf) -> Self {
        self.poller = ReconciliationPoller::new(self.machine.clone(), Arc::new(HostCache::new()), conf);
        self
    }

    pub fn recording_hook(&self, role: &str, event: RoleEvent) -> Arc<RecordingHook> {
        let hook = Arc::new(RecordingHook::default());
        self.hooks.register(role, event, hook.clone());
        hook
    }

    pub fn run_cycle(&self) -> Result<()> {
        self.poller.run_cycle().context("poller cycle")
    }

    pub fn role_state(&self, host_id: &str, role: &str) -> Result<RoleState> {
        Ok(self.machine.role_state(host_id, role)?)
    }

    /// Alternates poller cycles and host message delivery until nothing moves,
    /// at most `max_rounds` times.
    pub fn settle(&self, hosts: &mut [&mut SimulatedHost], max_rounds: usize) -> Result<()> {
        for round in 0..max_rounds {
            self.run_cycle()?;
            let mut delivered = 0;
            for host in hosts.iter_mut() {
                delivered += host.pump(&self.mqtt_client, &self.master)?;
            }
            if delivered == 0 {
                log::info!("✅ settled after {} rounds", round + 1);
                return Ok(());
            }
        }
        anyhow::bail!("fleet did not settle within {max_rounds} rounds")
    }
}

/// Host agent running in-process over an in-memory package manager.
pub struct SimulatedHost {
    pub host_id: String,
    pub db: MemoryAppDb,
    pub cache: MemoryAppCache,
    pub statuses: Vec<HostStatus>,
    converge: ConvergeLoop,
    data_dir: PathBuf,
    max_attempts: u32,
    consumed_direct: usize,
    consumed_broadcast: usize,
}

impl SimulatedHost {
    pub fn new(host_id: &str, data_dir: &Path, max_attempts: u32) -> Self {
        let db = MemoryAppDb::new();
        let cache = MemoryAppCache::new();
        let converge = Self::build_loop(host_id, &db, &cache, data_dir, max_attempts);
        Self {
            host_id: host_id.to_string(),
            db,
            cache,
            statuses: Vec::new(),
            converge,
            data_dir: data_dir.to_path_buf(),
            max_attempts,
            consumed_direct: 0,
            consumed_broadcast: 0,
        }
    }

    fn build_loop(
        host_id: &str,
        db: &MemoryAppDb,
        cache: &MemoryAppCache,
        data_dir: &Path,
        max_attempts: u32,
    ) -> ConvergeLoop {
        ConvergeLoop::new(
            host_id,
            Box::new(db.clone()),
            Box::new(cache.clone()),
            DesiredStore::new(data_dir, host_id),
            max_attempts,
        )
        .allow_exit(true)
    }

    /// Simulates an agent restart: installed apps and the cached target
    /// survive, in-memory attempt counters do not.
    pub fn restart(&mut self) {
        self.converge = Self::build_loop(&self.host_id, &self.db, &self.cache, &self.data_dir, self.max_attempts);
    }

    pub fn converge_loop(&self) -> &ConvergeLoop {
        &self.converge
    }

    /// Handles one message and forwards the produced statuses to the master.
    pub fn send(&mut self, msg: ControlMessage, master: &ConfigMaster) -> Result<LoopControl> {
        let mut produced = Vec::new();
        let control = self.converge.handle_message(msg, &mut produced);
        for status in produced {
            self.statuses.push(status.clone());
            master.ingest_status(status).context("master rejected status")?;
        }
        Ok(control)
    }

    pub fn heartbeat(&mut self, master: &ConfigMaster) -> Result<()> {
        self.send(ControlMessage::Heartbeat, master).map(|_| ())
    }

    /// Delivers control messages published since the last call. Returns how
    /// many were handled.
    pub fn pump(&mut self, mqtt: &MockMqttClient, master: &ConfigMaster) -> Result<usize> {
        let mut handled = 0;
        loop {
            let direct = mqtt.find_messages_by_topic(&control_topic(&self.host_id));
            let broadcast = mqtt.find_messages_by_topic(BROADCAST_CONTROL_TOPIC);
            let pending: Vec<_> = direct[self.consumed_direct.min(direct.len())..]
                .iter()
                .chain(&broadcast[self.consumed_broadcast.min(broadcast.len())..])
                .cloned()
                .collect();
            if pending.is_empty() {
                return Ok(handled);
            }
            self.consumed_direct = direct.len();
            self.consumed_broadcast = broadcast.len();
            for message in pending {
                let msg: ControlMessage = serde_json::from_slice(&message.payload)?;
                log::info!("📨 {} <- {}", self.host_id, msg.opcode());
                self.send(msg, master)?;
                handled += 1;
            }
        }
    }

    pub fn last_status(&self) -> Option<&HostStatus> {
        self.statuses.last()
    }

    pub fn status_kinds(&self) -> Vec<HostStatusKind> {
        self.statuses.iter().map(|s| s.status).collect()
    }
}
