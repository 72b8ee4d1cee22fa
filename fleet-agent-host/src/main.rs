//! Fleet Agent Host binary
//!
//! Loads configuration, resolves the host identity, builds the app backend
//! and runs the MQTT session until interrupted.

use anyhow::{Context, Result};
use fleet_agent_host::apps::{AppCache, AppDb, HttpAppCache, MemoryAppCache, MemoryAppDb, SystemAppDb};
use fleet_agent_host::config::{AgentConfig, Backend};
use fleet_agent_host::desired_store::DesiredStore;
use fleet_agent_host::discovery::{host_info, resolve_host_id};
use fleet_agent_host::session::{Session, SessionConfig};
use fleet_agent_host::ConvergeLoop;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Fleet Agent Host v{}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent configuration")?;
    let host_id = resolve_host_id(config.agent.host_id.as_deref(), &config.agent.data_dir)?;
    let info = host_info();
    info!("Host {} ({}, {} {})", host_id, info.hostname, info.os_family, info.arch);

    let timeout = Duration::from_secs(config.apps.command_timeout_secs);
    let (db, cache): (Box<dyn AppDb>, Box<dyn AppCache>) = match config.apps.backend {
        Backend::System => (
            Box::new(SystemAppDb::new(
                config.apps.package_prefix.clone(),
                config.apps.config_script_dir.clone(),
                config.apps.package_format,
                timeout,
            )),
            Box::new(HttpAppCache::new(config.apps.cache_dir.clone(), timeout)),
        ),
        Backend::Memory => {
            warn!("Using in-memory app backend, nothing will be installed on this host");
            (Box::new(MemoryAppDb::new()), Box::new(MemoryAppCache::new()))
        }
    };

    let converge = ConvergeLoop::new(
        host_id.clone(),
        db,
        cache,
        DesiredStore::new(&config.agent.data_dir, &host_id),
        config.converge.max_attempts,
    )
    .with_host_info(info)
    .allow_exit(config.agent.allow_exit_opcode);

    let session = Session::new(
        &host_id,
        &SessionConfig {
            broker_host: config.mqtt.broker_host.clone(),
            broker_port: config.mqtt.broker_port,
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            heartbeat_period: Duration::from_secs(config.converge.heartbeat_period_secs),
        },
    );

    tokio::select! {
        res = session.run(converge) => res?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    Ok(())
}
