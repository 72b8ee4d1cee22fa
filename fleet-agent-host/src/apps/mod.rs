//! App backends: the local package/service manager seen through two traits
//!
//! - `AppDb` queries and mutates what is installed on this host
//! - `AppCache` fetches a package for a desired app spec
//!
//! The convergence engine only talks to these traits. `memory` provides an
//! in-process implementation (tests, dry runs), `system` drives rpm/dpkg,
//! per-app config scripts and systemd.

pub mod memory;
pub mod system;

use fleet_common::{AppSpec, AppsConfig};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use memory::{MemoryAppCache, MemoryAppDb};
pub use system::{HttpAppCache, SystemAppDb};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("download of {app} {version} failed: {reason}")]
    Download {
        app: String,
        version: String,
        reason: String,
    },
    #[error("package operation on {app} failed: {reason}")]
    Package { app: String, reason: String },
    #[error("config operation on {app} failed: {reason}")]
    Config { app: String, reason: String },
    #[error("service operation on {app} failed: {reason}")]
    Service { app: String, reason: String },
    #[error("app {0} is not installed")]
    NotInstalled(String),
    #[error("command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An app as the local system reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledApp {
    pub name: String,
    pub version: String,
    pub config: Map<String, Value>,
    pub service_states: BTreeMap<String, bool>,
}

impl InstalledApp {
    /// Actual-side spec. `running` is only reported when every service agrees.
    pub fn to_spec(&self) -> AppSpec {
        let mut states = self.service_states.values();
        let running = match states.next() {
            Some(first) if states.all(|s| s == first) => Some(*first),
            _ => None,
        };
        AppSpec {
            version: self.version.clone(),
            running,
            service_states: if self.service_states.is_empty() {
                None
            } else {
                Some(self.service_states.clone())
            },
            config: self.config.clone(),
            ..AppSpec::default()
        }
    }
}

/// A package ready to be installed.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPackage {
    pub app: String,
    pub version: String,
    pub path: PathBuf,
}

/// What a desired spec asks of an app's services.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceTarget {
    /// Every service of the app in the same state.
    All(bool),
    /// Only the named services; others are left alone.
    Named(BTreeMap<String, bool>),
}

impl ServiceTarget {
    /// Explicit `service_states` win over `running`; neither means no opinion.
    pub fn from_spec(spec: &AppSpec) -> Option<Self> {
        match (&spec.service_states, spec.running) {
            (Some(states), _) => Some(ServiceTarget::Named(states.clone())),
            (None, Some(running)) => Some(ServiceTarget::All(running)),
            (None, None) => None,
        }
    }

    pub fn is_met_by(&self, current: &BTreeMap<String, bool>) -> bool {
        match self {
            ServiceTarget::All(running) => {
                !current.is_empty() && current.values().all(|s| s == running)
            }
            ServiceTarget::Named(wanted) => wanted
                .iter()
                .all(|(svc, running)| current.get(svc) == Some(running)),
        }
    }

    /// Concrete per-service states given the services an app actually has.
    pub fn resolve(&self, services: impl IntoIterator<Item = String>) -> BTreeMap<String, bool> {
        match self {
            ServiceTarget::All(running) => services.into_iter().map(|s| (s, *running)).collect(),
            ServiceTarget::Named(wanted) => wanted.clone(),
        }
    }
}

pub trait AppDb: Send {
    fn query_installed(&self) -> Result<BTreeMap<String, InstalledApp>, AppError>;
    fn install(&self, package: &LocalPackage) -> Result<(), AppError>;
    /// Stops the app's services before removing the package.
    fn uninstall(&self, app: &str) -> Result<(), AppError>;
    fn set_config(&self, app: &str, config: &Map<String, Value>) -> Result<(), AppError>;
    fn set_service_states(&self, app: &str, target: &ServiceTarget) -> Result<(), AppError>;
}

pub trait AppCache: Send {
    fn download(&self, app: &str, spec: &AppSpec) -> Result<LocalPackage, AppError>;
}

/// Actual config of the host, as reported in status messages.
pub fn current_config(db: &dyn AppDb) -> Result<AppsConfig, AppError> {
    Ok(db
        .query_installed()?
        .into_iter()
        .map(|(name, app)| (name, app.to_spec()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(states: &[(&str, bool)]) -> InstalledApp {
        InstalledApp {
            name: "foo".into(),
            version: "1.0".into(),
            config: Map::new(),
            service_states: states.iter().map(|(s, r)| (s.to_string(), *r)).collect(),
        }
    }

    #[test]
    fn test_running_reported_only_when_services_agree() {
        assert_eq!(installed(&[("a", true), ("b", true)]).to_spec().running, Some(true));
        assert_eq!(installed(&[("a", false)]).to_spec().running, Some(false));
        assert_eq!(installed(&[("a", true), ("b", false)]).to_spec().running, None);
        let none = installed(&[]).to_spec();
        assert_eq!(none.running, None);
        assert_eq!(none.service_states, None);
    }

    #[test]
    fn test_service_target_matching() {
        let current: BTreeMap<String, bool> =
            [("api".to_string(), true), ("worker".to_string(), false)].into();

        assert!(!ServiceTarget::All(true).is_met_by(&current));
        assert!(!ServiceTarget::All(false).is_met_by(&BTreeMap::new()));
        assert!(ServiceTarget::Named([("api".to_string(), true)].into()).is_met_by(&current));
        assert!(!ServiceTarget::Named([("db".to_string(), true)].into()).is_met_by(&current));
    }

    #[test]
    fn test_service_states_take_precedence_over_running() {
        let spec = AppSpec::new("1.0").with_running(true).with_service("api", false);
        assert_eq!(
            ServiceTarget::from_spec(&spec),
            Some(ServiceTarget::Named([("api".to_string(), false)].into()))
        );
        assert_eq!(ServiceTarget::from_spec(&AppSpec::new("1.0")), None);
    }
}
