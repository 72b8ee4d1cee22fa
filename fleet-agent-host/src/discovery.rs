//! Host identification
//!
//! This module handles:
//! - Stable host id (configured, persisted, or freshly generated)
//! - System description reported alongside every status (hostname, OS, arch)

use anyhow::{Context, Result};
use fleet_common::HostInfo;
use std::path::Path;
use sysinfo::System;
use tracing::{debug, info};

const HOST_ID_FILE: &str = "host_id";

/// Configured id wins; otherwise reuse `<data_dir>/host_id` or create it.
pub fn resolve_host_id(configured: Option<&str>, data_dir: &Path) -> Result<String> {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    let path = data_dir.join(HOST_ID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            debug!("Using persisted host id from {}", path.display());
            return Ok(existing.to_string());
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    std::fs::write(&path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Generated new host id {}", id);
    Ok(id)
}

pub fn host_info() -> HostInfo {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    HostInfo {
        hostname,
        os_family: std::env::consts::OS.to_string(),
        os_info: System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        arch: std::env::consts::ARCH.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_id_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let first = resolve_host_id(None, dir.path()).unwrap();
        let second = resolve_host_id(None, dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_configured_host_id_wins() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_host_id(Some("rack-1"), dir.path()).unwrap(), "rack-1");
        assert_eq!(resolve_host_id(Some("  "), dir.path()).unwrap().len(), 36);
    }

    #[test]
    fn test_host_info_is_filled() {
        let info = host_info();
        assert!(!info.hostname.is_empty());
        assert_eq!(info.arch, std::env::consts::ARCH);
    }
}
