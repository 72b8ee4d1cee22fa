//! Satisfaction predicate shared by the agent and the kernel
//!
//! `is_satisfied_by(desired, current)` answers whether the apps observed on a
//! host meet the configuration a controller asked for. Both the host-side
//! convergence loop and the kernel reconciliation poller rely on it, so the
//! rules live in exactly one place.

use crate::models::{AppSpec, AppsConfig};
use serde_json::{Map, Value};

/// Fields that only matter for delivering an app, never for comparing it.
pub const TRANSPORT_ONLY_FIELDS: [&str; 4] = ["url", "du_config", "pkginfo", "rank"];

/// `None` desired means "no opinion yet" and is always satisfied.
pub fn is_satisfied_by(desired: Option<&AppsConfig>, current: &AppsConfig) -> bool {
    let Some(desired) = desired else {
        return true;
    };

    if !desired.keys().eq(current.keys()) {
        return false;
    }

    desired.iter().all(|(name, wanted)| {
        let Some(have) = current.get(name) else {
            return false;
        };
        match (comparable(wanted), spec_to_map(have)) {
            (Some(wanted), Some(have)) => is_dict_subset(&wanted, &have),
            _ => false,
        }
    })
}

fn comparable(spec: &AppSpec) -> Option<Map<String, Value>> {
    let mut fields = spec_to_map(spec)?;
    for key in TRANSPORT_ONLY_FIELDS {
        fields.remove(key);
    }
    Some(fields)
}

fn spec_to_map(spec: &AppSpec) -> Option<Map<String, Value>> {
    match serde_json::to_value(spec) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Every key of `sub` exists in `sup` with a matching value. Maps recurse,
/// numbers compare numerically and lists never match.
pub fn is_dict_subset(sub: &Map<String, Value>, sup: &Map<String, Value>) -> bool {
    sub.iter().all(|(key, value)| match sup.get(key) {
        Some(other) => values_match(value, other),
        None => false,
    })
}

fn values_match(wanted: &Value, have: &Value) -> bool {
    match (wanted, have) {
        (Value::Object(a), Value::Object(b)) => is_dict_subset(a, b),
        (Value::Array(_), _) | (_, Value::Array(_)) => false,
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}
