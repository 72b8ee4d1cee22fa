//! Fleet common - shared building blocks for the kernel and host agents
//!
//! This crate carries everything both sides of the wire agree on:
//! - App/host data model (desired and actual app configuration)
//! - The "is desired satisfied by actual" predicate
//! - Control/status messages and MQTT topic names
//! - The `Publisher` seam used to send messages without owning a broker connection

pub mod error;
pub mod messages;
pub mod models;
pub mod publisher;
pub mod satisfaction;

pub use error::{ConfigError, PublishError};
pub use messages::{AgentMessage, ControlMessage};
pub use models::{parse_apps_config, AppSpec, AppsConfig, HostInfo, HostStatus, HostStatusKind};
pub use publisher::{publish_json, Publisher};
pub use satisfaction::{is_dict_subset, is_satisfied_by};
