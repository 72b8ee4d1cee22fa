//! Durable cache of the desired config
//!
//! Lives at `<data_dir>/<host_id>/desired_apps.json`. A missing file means no
//! cached target, which is not the same as an empty target.

use fleet_common::AppsConfig;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt desired config file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct DesiredStore {
    path: PathBuf,
}

impl DesiredStore {
    pub fn new(data_dir: &Path, host_id: &str) -> Self {
        Self {
            path: data_dir.join(host_id).join("desired_apps.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<AppsConfig>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `None` removes the file.
    pub fn save(&self, desired: Option<&AppsConfig>) -> Result<(), StoreError> {
        let Some(desired) = desired else {
            return match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(desired)?;
        // write + rename so a crash never leaves a truncated target behind
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), apps = desired.len(), "desired config saved");
        Ok(())
    }
}
