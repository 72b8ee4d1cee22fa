//! Agent converge loop driven through the kernel's config master.

use fleet_common::messages::{control_topic, STATUS_TOPIC};
use fleet_common::{ControlMessage, HostStatusKind};
use fleet_agent_host::apps::memory::MemoryAppCache;
use fleet_agent_host::converge::MqttStatusReporter;
use fleet_agent_host::LoopControl;
use fleet_devkit::{MockMqttClient, SimulatedHost};
use fleet_kernel::transport::ConfigMaster;
use serde_json::{json, Value};
use std::sync::Arc;

fn desired() -> Value {
    json!({
        "foo": {"version": "1.0", "running": true},
        "bar": {"version": "1.0", "running": false, "url": "http://repo/bar-1.0.rpm"}
    })
}

#[test]
fn test_set_config_from_master_converges_host() {
    let dir = tempfile::tempdir().unwrap();
    let mqtt = MockMqttClient::new();
    let master = ConfigMaster::with_publisher(Arc::new(mqtt.clone()));
    let mut host = SimulatedHost::new("h1", dir.path(), 10);
    host.db.seed("foo", "1.0", true, json!({}));
    host.heartbeat(&master).unwrap();

    master.set_host_apps_value("h1", &desired()).unwrap();
    assert_eq!(mqtt.find_messages_by_topic(&control_topic("h1")).len(), 1);
    assert_eq!(host.pump(&mqtt, &master).unwrap(), 1);

    assert_eq!(
        host.status_kinds(),
        vec![HostStatusKind::Ok, HostStatusKind::Converging, HostStatusKind::Ok]
    );
    assert!(host.statuses[1].desired_apps.is_some());
    let apps = &host.last_status().unwrap().apps;
    assert_eq!(apps.len(), 2);
    assert_eq!(apps["bar"].version, "1.0");
    assert_eq!(apps["bar"].running, Some(false));
    assert_eq!(host.db.operations(), vec!["install bar 1.0", "set_config bar", "set_services bar"]);

    // nothing left to send once the host is in sync
    host.heartbeat(&master).unwrap();
    assert_eq!(host.pump(&mqtt, &master).unwrap(), 0);
}

#[test]
fn test_restart_resumes_cached_target() {
    let dir = tempfile::tempdir().unwrap();
    let master = ConfigMaster::new();
    let mut host = SimulatedHost::new("h1", dir.path(), 1);
    host.cache.fail_download("bar");

    host.send(ControlMessage::SetConfig { data: desired() }, &master)
        .unwrap();
    assert_eq!(host.last_status().unwrap().status, HostStatusKind::Failed);

    // repository back online after the restart
    host.cache = MemoryAppCache::new();
    host.restart();
    assert!(host.converge_loop().desired().is_some());

    host.heartbeat(&master).unwrap();
    let last = host.last_status().unwrap();
    assert_eq!(last.status, HostStatusKind::Ok);
    assert!(host.converge_loop().desired().is_none());
}

#[test]
fn test_exit_opcode_and_status_wire_format() {
    let dir = tempfile::tempdir().unwrap();
    let master = ConfigMaster::new();
    let mut host = SimulatedHost::new("h1", dir.path(), 3);
    assert_eq!(host.send(ControlMessage::Exit, &master).unwrap(), LoopControl::Exit);

    let mqtt = MockMqttClient::new();
    let mut reporter = MqttStatusReporter::new(Arc::new(mqtt.clone()));
    let status = fleet_common::HostStatus::new("h1", HostStatusKind::Ok, Default::default());
    fleet_agent_host::StatusReporter::report(&mut reporter, status);

    let sent: Value = mqtt.get_last_json_message(STATUS_TOPIC).unwrap().unwrap();
    assert_eq!(sent["opcode"], json!("status"));
    assert_eq!(sent["data"]["host_id"], json!("h1"));
    assert_eq!(sent["data"]["status"], json!("ok"));
}
