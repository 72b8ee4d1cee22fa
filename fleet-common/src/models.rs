//! App and host data model
//!
//! `AppsConfig` is used for both sides of a convergence: the desired config a
//! controller writes and the actual config an agent reads back from the system.
//! An unset desired config is expressed as `Option::None`; an empty map is a
//! real target meaning "nothing installed".

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// One app, desired or installed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppSpec {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Per-service run state for apps managing several services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_states: Option<BTreeMap<String, bool>>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_rank",
        skip_serializing_if = "Option::is_none"
    )]
    pub rank: Option<f64>,
    /// Fields this crate does not interpret (du_config, pkginfo, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppSpec {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>, running: bool) -> Self {
        self.service_states
            .get_or_insert_with(BTreeMap::new)
            .insert(service.into(), running);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        if let Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    pub fn with_rank(mut self, rank: f64) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn rank_or_default(&self) -> f64 {
        self.rank.unwrap_or(0.0)
    }
}

// Ranks show up both as numbers and as numeric strings ("1.1").
fn deserialize_rank<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("rank '{s}' is not numeric"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "rank must be numeric, got {}",
            value_kind(&other)
        ))),
    }
}

/// app name -> spec
pub type AppsConfig = BTreeMap<String, AppSpec>;

/// Validates raw JSON before it is allowed anywhere near the convergence logic.
pub fn parse_apps_config(value: &Value) -> Result<AppsConfig, ConfigError> {
    let Value::Object(apps) = value else {
        return Err(ConfigError::NotAMapping(value_kind(value)));
    };

    let mut parsed = AppsConfig::new();
    for (name, raw) in apps {
        let Value::Object(fields) = raw else {
            return Err(ConfigError::InvalidApp {
                app: name.clone(),
                reason: format!("expected a mapping, got {}", value_kind(raw)),
            });
        };
        if !matches!(fields.get("version"), Some(Value::String(_))) {
            return Err(ConfigError::InvalidApp {
                app: name.clone(),
                reason: "missing string field 'version'".into(),
            });
        }
        let spec: AppSpec =
            serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidApp {
                app: name.clone(),
                reason: e.to_string(),
            })?;
        parsed.insert(name.clone(), spec);
    }
    Ok(parsed)
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Status an agent reports about its convergence progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatusKind {
    Ok,
    Converging,
    Retrying,
    Failed,
    /// Placeholder for a host that has been pushed to but never reported.
    Missing,
}

impl HostStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatusKind::Ok => "ok",
            HostStatusKind::Converging => "converging",
            HostStatusKind::Retrying => "retrying",
            HostStatusKind::Failed => "failed",
            HostStatusKind::Missing => "missing",
        }
    }

    /// Still working towards a target.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, HostStatusKind::Converging | HostStatusKind::Retrying)
    }
}

impl std::fmt::Display for HostStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os_family: String,
    pub os_info: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub host_id: String,
    pub status: HostStatusKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub apps: AppsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_apps: Option<AppsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<HostInfo>,
}

impl HostStatus {
    pub fn new(host_id: impl Into<String>, status: HostStatusKind, apps: AppsConfig) -> Self {
        Self {
            host_id: host_id.into(),
            status,
            timestamp: OffsetDateTime::now_utc(),
            apps,
            desired_apps: None,
            info: None,
        }
    }

    /// Row for a host that was pushed to before it ever reported.
    pub fn missing(host_id: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            ..Self::new(host_id, HostStatusKind::Missing, AppsConfig::new())
        }
    }

    pub fn with_desired(mut self, desired: Option<AppsConfig>) -> Self {
        self.desired_apps = desired;
        self
    }

    pub fn with_info(mut self, info: Option<HostInfo>) -> Self {
        self.info = info;
        self
    }
}
