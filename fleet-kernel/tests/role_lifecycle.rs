//! Kernel + simulated agents, no broker.

use fleet_common::messages::control_topic;
use fleet_common::{is_satisfied_by, ControlMessage, HostStatusKind};
use fleet_devkit::fixtures::{apps, role};
use fleet_devkit::{SimulatedHost, TestHarness};
use fleet_kernel::hooks::RoleEvent;
use fleet_kernel::store::{JsonRoleStore, RoleStore};
use fleet_kernel::{RoleError, RoleState};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn stack_role() -> fleet_kernel::RoleDefinition {
    role(
        "stack",
        "1.0",
        json!({
            "foo": {"version": "1.0", "running": true},
            "bar": {"version": "1.0", "running": false}
        }),
    )
    .unwrap()
}

fn host_with_foo(dir: &std::path::Path, max_attempts: u32) -> SimulatedHost {
    let host = SimulatedHost::new("h1", dir, max_attempts);
    host.db.seed("foo", "1.0", true, json!({}));
    host
}

#[test]
fn test_end_to_end_role_reaches_applied() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    let mut host = host_with_foo(dir.path(), 10);
    host.heartbeat(&harness.master).unwrap();

    harness.run_cycle().unwrap();
    assert!(harness.poller.cache().unauthorized().contains_key("h1"));

    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();

    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::Applied);
    assert!(harness.poller.cache().unauthorized().is_empty());

    let converging = host
        .statuses
        .iter()
        .find(|s| s.status == HostStatusKind::Converging)
        .expect("a converging status");
    assert!(converging.desired_apps.is_some());

    let last = host.last_status().unwrap();
    assert_eq!(last.status, HostStatusKind::Ok);
    let expected = apps(json!({
        "foo": {"version": "1.0", "running": true},
        "bar": {"version": "1.0", "running": false}
    }))
    .unwrap();
    assert!(is_satisfied_by(Some(&expected), &last.apps));
    assert_eq!(last.apps["bar"].running, Some(false));
    assert_eq!(last.apps["foo"].running, Some(true));

    assert!(harness.notifier.count("update", "role") >= 5);
    assert_eq!(harness.notifier.count("create", "host"), 1);
}

#[test]
fn test_delete_role_uninstalls_and_forgets_host() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    let hook = harness.recording_hook("stack", RoleEvent::OnDeauthConverged);
    let mut host = host_with_foo(dir.path(), 10);
    host.heartbeat(&harness.master).unwrap();

    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    harness.machine.delete_role("h1", "stack").unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();

    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::NotApplied);
    assert!(harness.store.get_host("h1").unwrap().is_none());
    assert!(host.db.installed("foo").is_none());
    assert!(host.db.installed("bar").is_none());
    assert_eq!(hook.calls(), vec![("h1".to_string(), "stack".to_string(), RoleEvent::OnDeauthConverged)]);

    // back to the unauthorized bucket
    harness.run_cycle().unwrap();
    assert!(harness.poller.cache().unauthorized().contains_key("h1"));
}

#[test]
fn test_role_parked_at_pre_auth_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("roles.json");

    {
        let store = Arc::new(JsonRoleStore::open(&store_path).unwrap());
        let harness = TestHarness::with_store(vec![stack_role()], store.clone()).unwrap();
        harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
        // process dies right after committing PRE_AUTH
        let mut assoc = store.get_association("h1", "stack").unwrap().unwrap();
        assoc.current_state = RoleState::PreAuth;
        store.put_association(&assoc).unwrap();
    }

    let store = Arc::new(JsonRoleStore::open(&store_path).unwrap());
    let harness = TestHarness::with_store(vec![stack_role()], store).unwrap();
    let mut host = host_with_foo(dir.path(), 10);
    host.heartbeat(&harness.master).unwrap();

    harness.run_cycle().unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::AuthConverging);
    let sent: Option<ControlMessage> = harness
        .mqtt_client
        .get_last_json_message(&control_topic("h1"))
        .unwrap();
    assert!(matches!(sent, Some(ControlMessage::SetConfig { .. })));

    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::Applied);
}

#[test]
fn test_delete_role_conflicts_mid_apply() {
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    for state in [RoleState::StartApply, RoleState::PreAuth, RoleState::AuthConverging] {
        let mut assoc = harness.store.get_association("h1", "stack").unwrap().unwrap();
        assoc.current_state = state;
        harness.store.put_association(&assoc).unwrap();

        let err = harness.machine.delete_role("h1", "stack").unwrap_err();
        assert!(matches!(err, RoleError::RoleUpdateConflict { .. }), "{state}");
        assert_eq!(harness.role_state("h1", "stack").unwrap(), state);
    }
}

#[test]
fn test_failing_host_ends_in_auth_error_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    let mut host = host_with_foo(dir.path(), 2);
    host.db.fail_app("bar");
    host.heartbeat(&harness.master).unwrap();

    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::AuthConverging);

    host.heartbeat(&harness.master).unwrap();
    harness.run_cycle().unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::AuthError);

    let kinds = host.status_kinds();
    assert_eq!(
        kinds[1..],
        [HostStatusKind::Converging, HostStatusKind::Retrying, HostStatusKind::Converging, HostStatusKind::Failed]
    );

    // stays failed without a new target
    host.heartbeat(&harness.master).unwrap();
    assert_eq!(host.status_kinds().last(), Some(&HostStatusKind::Failed));

    host.db.clear_failures();
    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::Applied);
}

#[test]
fn test_on_auth_hook_failure_rolls_back() {
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    let hook = harness.recording_hook("stack", RoleEvent::OnAuth);
    hook.set_failing(true);

    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    // the poller logs the hook failure and keeps going
    harness.run_cycle().unwrap();

    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::NotApplied);
    assert_eq!(hook.calls().len(), 1);
    assert!(harness.master.desired_apps("h1").is_none());
    assert_eq!(harness.notifier.count("delete", "role"), 1);
}

#[test]
fn test_failed_deauth_hook_keeps_auth_error() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    let converged = harness.recording_hook("stack", RoleEvent::OnAuthConverged);
    converged.set_failing(true);
    let deauth = harness.recording_hook("stack", RoleEvent::OnDeauth);
    deauth.set_failing(true);
    let mut host = host_with_foo(dir.path(), 10);
    host.heartbeat(&harness.master).unwrap();

    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::AuthError);

    harness.machine.delete_role("h1", "stack").unwrap();
    let err = harness.machine.advance_transient_states("h1").unwrap_err();
    assert!(matches!(err, RoleError::Hook { event: RoleEvent::OnDeauth, .. }));
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::AuthError);

    let expected = harness.machine.expected_apps("h1").unwrap();
    assert!(expected.contains_key("foo") && expected.contains_key("bar"));
    assert!(host.db.installed("bar").is_some());

    // the operator can still drop the role once the hook is fixed
    deauth.set_failing(false);
    harness.machine.delete_role("h1", "stack").unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::NotApplied);
    assert!(host.db.installed("bar").is_none());
}

#[test]
fn test_failed_deauth_hook_keeps_deauth_error() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestHarness::new(vec![stack_role()]).unwrap();
    let deauth_converged = harness.recording_hook("stack", RoleEvent::OnDeauthConverged);
    deauth_converged.set_failing(true);
    let mut host = host_with_foo(dir.path(), 10);
    host.heartbeat(&harness.master).unwrap();

    harness.machine.add_role("h1", "stack", None, BTreeMap::new()).unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    harness.machine.delete_role("h1", "stack").unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::DeauthError);

    let deauth = harness.recording_hook("stack", RoleEvent::OnDeauth);
    deauth.set_failing(true);
    harness.machine.delete_role("h1", "stack").unwrap();
    assert!(harness.machine.advance_transient_states("h1").is_err());
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::DeauthError);
    assert!(harness.machine.expected_apps("h1").unwrap().is_empty());

    deauth.set_failing(false);
    deauth_converged.set_failing(false);
    harness.machine.delete_role("h1", "stack").unwrap();
    harness.settle(&mut [&mut host], 10).unwrap();
    assert_eq!(harness.role_state("h1", "stack").unwrap(), RoleState::NotApplied);
    assert!(harness.store.get_host("h1").unwrap().is_none());
}
