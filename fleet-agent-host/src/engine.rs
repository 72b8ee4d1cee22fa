//! App convergence engine
//!
//! Diffs the installed apps against a desired config and performs the minimal
//! set of operations to close the gap:
//! - removed apps are uninstalled (unless non-destructive)
//! - kept apps with another version are fully reinstalled
//! - kept apps with the right version get config and service fixes
//! - added apps are downloaded, installed, configured and started/stopped
//!
//! Added and kept apps are handled in ascending `rank`. The returned count is
//! the number of changes, so `0` means converged. In probe mode the same
//! comparisons run without any side effect.

use crate::apps::{AppCache, AppDb, AppError, ServiceTarget};
use fleet_common::{is_dict_subset, AppSpec, AppsConfig};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeOptions {
    /// Leave apps that are no longer desired in place.
    pub non_destructive: bool,
    /// Only count changes.
    pub probe_only: bool,
}

impl ConvergeOptions {
    pub fn probe() -> Self {
        Self {
            probe_only: true,
            ..Self::default()
        }
    }
}

pub fn process_apps(
    db: &dyn AppDb,
    cache: &dyn AppCache,
    desired: &AppsConfig,
    opts: ConvergeOptions,
) -> Result<usize, AppError> {
    let installed = db.query_installed()?;
    let apply = !opts.probe_only;
    let mut changes = 0;

    let removed: Vec<&String> = installed.keys().filter(|n| !desired.contains_key(*n)).collect();
    let kept = by_rank(desired.iter().filter(|(n, _)| installed.contains_key(*n)));
    let added = by_rank(desired.iter().filter(|(n, _)| !installed.contains_key(*n)));

    if !opts.non_destructive {
        for name in removed {
            changes += 1;
            if apply {
                info!(app = %name, "uninstalling app");
                db.uninstall(name)?;
            }
        }
    }

    for (name, spec) in kept {
        let Some(current) = installed.get(name) else {
            continue;
        };
        if current.version != spec.version {
            changes += 1;
            if apply {
                info!(app = %name, from = %current.version, to = %spec.version, "upgrading app");
                reinstall(db, cache, name, spec)?;
            }
            continue;
        }

        if !is_dict_subset(&spec.config, &current.config) {
            changes += 1;
            if apply {
                info!(app = %name, "updating app config");
                db.set_config(name, &spec.config)?;
            }
        }

        if let Some(target) = ServiceTarget::from_spec(spec) {
            if !target.is_met_by(&current.service_states) {
                changes += 1;
                if apply {
                    info!(app = %name, ?target, "changing service states");
                    db.set_service_states(name, &target)?;
                }
            }
        }
    }

    for (name, spec) in added {
        changes += 1;
        if apply {
            info!(app = %name, version = %spec.version, "installing app");
            install(db, cache, name, spec)?;
        }
    }

    debug!(changes, probe = opts.probe_only, "process_apps done");
    Ok(changes)
}

fn by_rank<'a>(apps: impl Iterator<Item = (&'a String, &'a AppSpec)>) -> Vec<(&'a String, &'a AppSpec)> {
    let mut apps: Vec<_> = apps.collect();
    // stable sort: equal ranks keep name order
    apps.sort_by(|a, b| a.1.rank_or_default().total_cmp(&b.1.rank_or_default()));
    apps
}

// Download first so a failed fetch leaves the old version installed.
fn reinstall(db: &dyn AppDb, cache: &dyn AppCache, name: &str, spec: &AppSpec) -> Result<(), AppError> {
    let package = cache.download(name, spec)?;
    db.uninstall(name)?;
    db.install(&package)?;
    configure(db, name, spec)
}

fn install(db: &dyn AppDb, cache: &dyn AppCache, name: &str, spec: &AppSpec) -> Result<(), AppError> {
    let package = cache.download(name, spec)?;
    db.install(&package)?;
    configure(db, name, spec)
}

fn configure(db: &dyn AppDb, name: &str, spec: &AppSpec) -> Result<(), AppError> {
    db.set_config(name, &spec.config)?;
    if let Some(target) = ServiceTarget::from_spec(spec) {
        db.set_service_states(name, &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::{current_config, MemoryAppCache, MemoryAppDb};
    use fleet_common::{is_satisfied_by, parse_apps_config};
    use serde_json::{json, Value};

    fn apps(value: Value) -> AppsConfig {
        parse_apps_config(&value).unwrap()
    }

    fn run(db: &MemoryAppDb, desired: &AppsConfig, opts: ConvergeOptions) -> usize {
        process_apps(db, &MemoryAppCache::new(), desired, opts).unwrap()
    }

    fn foo_bar() -> AppsConfig {
        apps(json!({
            "foo": {
                "version": "1.0",
                "url": "http://zz.com/foo-1.0.rpm",
                "running": true,
                "config": {"default": {"x": 1, "y": 2}, "backup": {"x": 3, "y": 5}}
            },
            "bar": {
                "version": "1.1",
                "url": "http://zz.com/bar-1.1.rpm",
                "running": false,
                "config": {"x": 1}
            }
        }))
    }

    #[test]
    fn test_full_lifecycle() {
        let db = MemoryAppDb::new();
        let opts = ConvergeOptions::default();

        let mut desired = foo_bar();
        assert_eq!(run(&db, &desired, ConvergeOptions::probe()), 2);
        assert!(db.operations().is_empty());
        assert_eq!(run(&db, &desired, opts), 2);
        assert!(is_satisfied_by(Some(&desired), &current_config(&db).unwrap()));
        assert_eq!(run(&db, &desired, opts), 0);

        // upgrade foo, drop bar, add ostackhost
        desired.remove("bar");
        desired.get_mut("foo").unwrap().version = "1.2".into();
        desired.get_mut("foo").unwrap().url = Some("http://zz.com/foo-1.2.rpm".into());
        desired.insert("ostackhost".into(), AppSpec::new("3.0").with_running(true));
        assert_eq!(run(&db, &desired, opts), 3);
        assert_eq!(run(&db, &desired, opts), 0);
        assert_eq!(db.installed("foo").unwrap().version, "1.2");

        // config only
        desired.get_mut("foo").unwrap().config = json!({"default": {"x": 9}}).as_object().unwrap().clone();
        assert_eq!(run(&db, &desired, opts), 1);
        assert_eq!(run(&db, &desired, opts), 0);

        // run state only
        desired.get_mut("ostackhost").unwrap().running = Some(false);
        assert_eq!(run(&db, &desired, opts), 1);
        assert_eq!(run(&db, &desired, opts), 0);
    }

    #[test]
    fn test_empty_desired_removes_everything() {
        let db = MemoryAppDb::new();
        db.seed("foo", "1.0", true, json!({}));
        db.seed("bar", "1.0", false, json!({}));
        db.seed("baz", "2.0", true, json!({}));

        assert_eq!(run(&db, &AppsConfig::new(), ConvergeOptions::default()), 3);
        assert!(current_config(&db).unwrap().is_empty());
    }

    #[test]
    fn test_non_destructive_keeps_unlisted_apps() {
        let db = MemoryAppDb::new();
        db.seed("foo", "1.0", true, json!({}));
        db.seed("bar", "1.0", true, json!({}));

        let desired = apps(json!({"foo": {"version": "1.0", "running": false}}));
        let opts = ConvergeOptions {
            non_destructive: true,
            probe_only: false,
        };
        assert_eq!(run(&db, &desired, opts), 1);
        assert!(db.installed("bar").is_some());
        assert_eq!(db.installed("foo").unwrap().service_states["foo"], false);
    }

    #[test]
    fn test_version_change_forces_reinstall_even_with_config_change() {
        let db = MemoryAppDb::new();
        db.seed("foo", "1.0", true, json!({"x": 1}));

        let desired = apps(json!({
            "foo": {"version": "1.2", "running": true, "config": {"x": 2}}
        }));
        assert_eq!(run(&db, &desired, ConvergeOptions::default()), 1);
        assert_eq!(
            db.operations(),
            vec![
                "uninstall foo",
                "install foo 1.2",
                "set_config foo",
                "set_services foo"
            ]
        );
    }

    #[test]
    fn test_config_and_service_changes_count_separately() {
        let db = MemoryAppDb::new();
        db.seed("foo", "1.0", true, json!({"x": 1}));

        let desired = apps(json!({
            "foo": {"version": "1.0", "running": false, "config": {"x": 2}}
        }));
        assert_eq!(run(&db, &desired, ConvergeOptions::default()), 2);
        assert_eq!(db.operations(), vec!["set_config foo", "set_services foo"]);
    }

    #[test]
    fn test_added_apps_follow_rank() {
        let db = MemoryAppDb::new();
        let desired = apps(json!({
            "a": {"version": "1.0", "rank": 20},
            "b": {"version": "1.0", "rank": "1.5"},
            "c": {"version": "1.0"}
        }));
        run(&db, &desired, ConvergeOptions::default());
        let installs: Vec<String> = db
            .operations()
            .into_iter()
            .filter(|op| op.starts_with("install"))
            .collect();
        assert_eq!(installs, vec!["install c 1.0", "install b 1.0", "install a 1.0"]);
    }

    #[test]
    fn test_failure_propagates() {
        let db = MemoryAppDb::new();
        let cache = MemoryAppCache::new();
        cache.fail_download("foo");
        let desired = apps(json!({"foo": {"version": "1.0"}}));
        let res = process_apps(&db, &cache, &desired, ConvergeOptions::default());
        assert!(matches!(res, Err(AppError::Download { .. })));
        assert!(db.installed("foo").is_none());
    }
}
