/**
 * FLEET KERNEL - Point d'entrée du serveur central
 *
 * RÔLE : Charge la config (YAML + .env), ouvre le store des rôles, branche
 * le maître de configuration sur MQTT, démarre le poller de réconciliation
 * puis applique les assignations déclarées.
 *
 * ARRÊT : Ctrl-C → le poller finit son cycle en cours puis s'arrête.
 */

use anyhow::Context;
use fleet_common::Publisher;
use fleet_kernel::config::load_config;
use fleet_kernel::hooks::HookRegistry;
use fleet_kernel::notifier::MqttNotifier;
use fleet_kernel::poller::{self, HostCache, ReconciliationPoller};
use fleet_kernel::store::JsonRoleStore;
use fleet_kernel::transport::{create_mqtt_client, spawn_status_listener, ConfigMaster};
use fleet_kernel::{Controller, RoleCatalog, RoleStateMachine};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    let catalog = RoleCatalog::new(cfg.roles.clone()).context("invalid role catalog")?;
    let hooks = Arc::new(HookRegistry::new());
    for def in catalog.definitions() {
        hooks.register_specs(&def.name, &def.hooks);
    }
    info!("[kernel] {} roles in catalog", catalog.names().count());

    std::fs::create_dir_all(&cfg.storage.data_dir)
        .with_context(|| format!("cannot create {}", cfg.storage.data_dir.display()))?;
    let store = Arc::new(JsonRoleStore::open(cfg.storage.roles_file()).context("cannot open role store")?);

    // MQTT : maître de config + notifications
    let (client, eventloop) = create_mqtt_client(&cfg.mqtt);
    let publisher: Arc<dyn Publisher> = Arc::new(client.clone());
    let master = Arc::new(ConfigMaster::with_publisher(publisher.clone()));
    let listener = spawn_status_listener(client.clone(), eventloop, master.clone());

    let machine = Arc::new(RoleStateMachine::new(
        store,
        master,
        Arc::new(catalog),
        hooks,
        Arc::new(MqttNotifier::new(publisher)),
    ));

    let poller = Arc::new(ReconciliationPoller::new(
        machine.clone(),
        Arc::new(HostCache::new()),
        cfg.poller.clone(),
    ));
    let handle = poller::spawn(poller);

    let controller = Controller::new(machine, handle.waker());
    let applied = controller.apply_assignments(&cfg.assignments);
    info!("[kernel] ready, {applied} role assignments started");

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("[kernel] shutting down");
    handle.stop().await;
    listener.abort();
    let _ = client.try_disconnect();
    Ok(())
}
