/**
 * ROLE CATALOG - Définitions des rôles déployables sur les hôtes
 *
 * RÔLE : Un rôle = nom + version + gabarit d'apps + paramètres par défaut + hooks.
 * Le gabarit est rendu par hôte : chaque valeur texte contenant `{token}` est
 * substituée depuis les paramètres (défauts ⊕ paramètres d'association ⊕
 * host_id / role_name / role_version). Les tokens inconnus restent tels quels.
 *
 * VERSIONS : plusieurs versions d'un même rôle peuvent coexister ; la version
 * par défaut est la dernière déclarée.
 */

use crate::hooks::{HookSpec, RoleEvent};
use fleet_common::{parse_apps_config, AppsConfig, ConfigError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub apps: Map<String, Value>,
    #[serde(default)]
    pub default_params: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: BTreeMap<RoleEvent, Vec<HookSpec>>,
}

impl RoleDefinition {
    pub fn render(
        &self,
        host_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<AppsConfig, ConfigError> {
        let mut tokens = self.default_params.clone();
        tokens.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        tokens.insert("host_id".into(), host_id.to_string());
        tokens.insert("role_name".into(), self.name.clone());
        tokens.insert("role_version".into(), self.version.clone());

        let rendered = substitute(&Value::Object(self.apps.clone()), &tokens);
        parse_apps_config(&rendered)
    }
}

fn substitute(value: &Value, tokens: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) if s.contains('{') => {
            let mut out = s.clone();
            for (key, replacement) in tokens {
                out = out.replace(&format!("{{{key}}}"), replacement);
            }
            Value::String(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, tokens)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, tokens)).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoleCatalog {
    // name -> versions in declaration order
    roles: BTreeMap<String, Vec<RoleDefinition>>,
}

impl RoleCatalog {
    /// Rejects definitions whose app template does not render to a valid config.
    pub fn new(definitions: Vec<RoleDefinition>) -> Result<Self, ConfigError> {
        let mut catalog = Self::default();
        for def in definitions {
            catalog.insert(def)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, def: RoleDefinition) -> Result<(), ConfigError> {
        def.render("", &BTreeMap::new())?;
        let versions = self.roles.entry(def.name.clone()).or_default();
        versions.retain(|existing| existing.version != def.version);
        versions.push(def);
        Ok(())
    }

    pub fn get(&self, name: &str, version: &str) -> Option<&RoleDefinition> {
        self.roles.get(name)?.iter().find(|d| d.version == version)
    }

    pub fn latest(&self, name: &str) -> Option<&RoleDefinition> {
        self.roles.get(name)?.last()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &RoleDefinition> {
        self.roles.values().flatten()
    }
}
