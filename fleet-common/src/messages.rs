//! Kernel <-> agent messages and the topics they travel on

use crate::models::HostStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_TOPIC: &str = "fleet/hosts/status@v1";
pub const CONTROL_TOPIC_PREFIX: &str = "fleet/hosts/control@v1";
pub const BROADCAST_CONTROL_TOPIC: &str = "fleet/hosts/control@v1/broadcast";
pub const CHANGES_TOPIC: &str = "fleet/changes@v1";

pub fn control_topic(host_id: &str) -> String {
    format!("{CONTROL_TOPIC_PREFIX}/{host_id}")
}

/// Kernel -> agent. `set_config` carries raw JSON; the agent validates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "opcode", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    Heartbeat,
    SetConfig { data: Value },
    Exit,
}

impl ControlMessage {
    pub fn opcode(&self) -> &'static str {
        match self {
            ControlMessage::Ping => "ping",
            ControlMessage::Heartbeat => "heartbeat",
            ControlMessage::SetConfig { .. } => "set_config",
            ControlMessage::Exit => "exit",
        }
    }
}

/// Agent -> kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "opcode", rename_all = "snake_case")]
pub enum AgentMessage {
    Status { data: HostStatus },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppsConfig, HostStatusKind};
    use serde_json::json;

    #[test]
    fn test_control_wire_format() {
        let msg: ControlMessage =
            serde_json::from_value(json!({"opcode": "set_config", "data": {}})).unwrap();
        assert_eq!(msg, ControlMessage::SetConfig { data: json!({}) });

        let ping: ControlMessage = serde_json::from_str(r#"{"opcode":"ping"}"#).unwrap();
        assert_eq!(ping, ControlMessage::Ping);
        assert_eq!(
            serde_json::to_value(ControlMessage::Heartbeat).unwrap(),
            json!({"opcode": "heartbeat"})
        );
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let res = serde_json::from_str::<ControlMessage>(r#"{"opcode":"get_support"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_status_envelope() {
        let status = HostStatus::new("h1", HostStatusKind::Ok, AppsConfig::new());
        let value = serde_json::to_value(AgentMessage::Status { data: status }).unwrap();
        assert_eq!(value["opcode"], json!("status"));
        assert_eq!(value["data"]["host_id"], json!("h1"));
        assert_eq!(control_topic("h1"), "fleet/hosts/control@v1/h1");
    }
}
