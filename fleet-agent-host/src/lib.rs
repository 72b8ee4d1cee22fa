//! Fleet Agent Host - keeps the apps of one host converged on the kernel's target
//!
//! The agent:
//! - Listens for control messages (ping, heartbeat, set_config, exit) over MQTT
//! - Diffs desired against installed apps and applies the minimal changes
//! - Caches its target on disk so a restart resumes where it stopped
//! - Reports ok / converging / retrying / failed after every message

pub mod apps;
pub mod config;
pub mod converge;
pub mod desired_store;
pub mod discovery;
pub mod engine;
pub mod session;

pub use converge::{ConvergeLoop, LoopControl, StatusReporter};
pub use engine::{process_apps, ConvergeOptions};
