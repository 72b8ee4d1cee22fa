/*!
Fixtures : rôles, configs d'apps et statuts prêts à l'emploi
*/

use anyhow::{Context, Result};
use fleet_common::{parse_apps_config, AppsConfig, HostStatus, HostStatusKind};
use fleet_kernel::roles::RoleDefinition;
use serde_json::{json, Value};

/// Role without hooks nor default params. `apps` is the JSON app template.
pub fn role(name: &str, version: &str, apps: Value) -> Result<RoleDefinition> {
    serde_json::from_value(json!({
        "name": name,
        "version": version,
        "apps": apps,
    }))
    .with_context(|| format!("invalid role fixture {name}"))
}

pub fn apps(value: Value) -> Result<AppsConfig> {
    parse_apps_config(&value).context("invalid apps fixture")
}

pub fn status(host_id: &str, kind: HostStatusKind, apps: AppsConfig) -> HostStatus {
    HostStatus::new(host_id, kind, apps)
}
