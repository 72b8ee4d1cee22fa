//! In-memory package manager
//!
//! Behaves like a small rpm database: installing a package registers the app
//! with a single service named after it (stopped), uninstalling stops every
//! service first. Handles are cheap clones sharing one state, so a test can
//! keep a handle while the converge loop owns another.
//!
//! A package URL of the form `.../<app>-<version>.rpm` overrides the version
//! being installed, which lets tests build configs that can never converge.

use super::{AppCache, AppDb, AppError, InstalledApp, LocalPackage, ServiceTarget};
use fleet_common::AppSpec;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryDbState {
    apps: BTreeMap<String, InstalledApp>,
    operations: Vec<String>,
    failing: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAppDb {
    state: Arc<Mutex<MemoryDbState>>,
}

impl MemoryAppDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an installed app, bypassing the operation log.
    pub fn seed(&self, name: &str, version: &str, running: bool, config: Value) {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let app = InstalledApp {
            name: name.to_string(),
            version: version.to_string(),
            config,
            service_states: [(name.to_string(), running)].into(),
        };
        self.state.lock().apps.insert(name.to_string(), app);
    }

    /// Every mutating call on `app` fails until cleared.
    pub fn fail_app(&self, app: &str) {
        self.state.lock().failing.insert(app.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Mutations performed so far, e.g. `"install foo 1.0"`.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    pub fn installed(&self, app: &str) -> Option<InstalledApp> {
        self.state.lock().apps.get(app).cloned()
    }

    fn mutate<F>(&self, app: &str, op: String, f: F) -> Result<(), AppError>
    where
        F: FnOnce(&mut BTreeMap<String, InstalledApp>) -> Result<(), AppError>,
    {
        let mut state = self.state.lock();
        if state.failing.contains(app) {
            return Err(AppError::Package {
                app: app.to_string(),
                reason: format!("injected failure during {op}"),
            });
        }
        f(&mut state.apps)?;
        debug!(%op, "memory app db");
        state.operations.push(op);
        Ok(())
    }
}

impl AppDb for MemoryAppDb {
    fn query_installed(&self) -> Result<BTreeMap<String, InstalledApp>, AppError> {
        Ok(self.state.lock().apps.clone())
    }

    fn install(&self, package: &LocalPackage) -> Result<(), AppError> {
        let op = format!("install {} {}", package.app, package.version);
        self.mutate(&package.app, op, |apps| {
            let previous = apps.get(&package.app);
            let app = InstalledApp {
                name: package.app.clone(),
                version: package.version.clone(),
                config: previous.map(|p| p.config.clone()).unwrap_or_default(),
                service_states: [(package.app.clone(), false)].into(),
            };
            apps.insert(package.app.clone(), app);
            Ok(())
        })
    }

    fn uninstall(&self, app: &str) -> Result<(), AppError> {
        self.mutate(app, format!("uninstall {app}"), |apps| {
            let mut removed = apps
                .remove(app)
                .ok_or_else(|| AppError::NotInstalled(app.to_string()))?;
            removed.service_states.values_mut().for_each(|s| *s = false);
            Ok(())
        })
    }

    fn set_config(&self, app: &str, config: &Map<String, Value>) -> Result<(), AppError> {
        self.mutate(app, format!("set_config {app}"), |apps| {
            let installed = apps
                .get_mut(app)
                .ok_or_else(|| AppError::NotInstalled(app.to_string()))?;
            installed.config = config.clone();
            Ok(())
        })
    }

    fn set_service_states(&self, app: &str, target: &ServiceTarget) -> Result<(), AppError> {
        self.mutate(app, format!("set_services {app}"), |apps| {
            let installed = apps
                .get_mut(app)
                .ok_or_else(|| AppError::NotInstalled(app.to_string()))?;
            let resolved = target.resolve(installed.service_states.keys().cloned());
            installed.service_states.extend(resolved);
            Ok(())
        })
    }
}

/// Download stand-in: resolves a package path without touching the network.
#[derive(Debug, Clone, Default)]
pub struct MemoryAppCache {
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryAppCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_download(&self, app: &str) {
        self.failing.lock().insert(app.to_string());
    }
}

impl AppCache for MemoryAppCache {
    fn download(&self, app: &str, spec: &AppSpec) -> Result<LocalPackage, AppError> {
        if self.failing.lock().contains(app) {
            return Err(AppError::Download {
                app: app.to_string(),
                version: spec.version.clone(),
                reason: "injected failure".into(),
            });
        }
        let version = spec
            .url
            .as_deref()
            .and_then(|url| version_from_url(app, url))
            .unwrap_or_else(|| spec.version.clone());
        Ok(LocalPackage {
            app: app.to_string(),
            path: PathBuf::from(format!("/memory/{app}-{version}.rpm")),
            version,
        })
    }
}

/// `http://zz.com/foo-1.2.rpm` -> `1.2` for app `foo`.
pub(crate) fn version_from_url(app: &str, url: &str) -> Option<String> {
    let file = url.rsplit('/').next()?;
    let stem = file
        .strip_suffix(".rpm")
        .or_else(|| file.strip_suffix(".deb"))?;
    let version = stem.strip_prefix(app)?.strip_prefix('-')?;
    (!version.is_empty()).then(|| version.to_string())
}
