//! Operator entry points: role changes go through the state machine, then the
//! poller is woken so the new transition starts without waiting a full interval.

use crate::config::Assignment;
use crate::poller::PollerWaker;
use crate::role_states::RoleState;
use crate::state_machine::{RoleError, RoleStateMachine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Controller {
    machine: Arc<RoleStateMachine>,
    waker: PollerWaker,
}

impl Controller {
    pub fn new(machine: Arc<RoleStateMachine>, waker: PollerWaker) -> Self {
        Self { machine, waker }
    }

    pub fn machine(&self) -> &Arc<RoleStateMachine> {
        &self.machine
    }

    pub fn add_role(
        &self,
        host_id: &str,
        role: &str,
        version: Option<&str>,
        params: BTreeMap<String, String>,
    ) -> Result<RoleState, RoleError> {
        let state = self.machine.add_role(host_id, role, version, params)?;
        self.waker.wake();
        Ok(state)
    }

    pub fn delete_role(&self, host_id: &str, role: &str) -> Result<RoleState, RoleError> {
        let state = self.machine.delete_role(host_id, role)?;
        self.waker.wake();
        Ok(state)
    }

    pub fn delete_host(&self, host_id: &str) -> Result<Vec<String>, RoleError> {
        let result = self.machine.delete_host(host_id);
        // roles started before a conflict still need the poller
        self.waker.wake();
        result
    }

    /// Applies configured assignments for roles not yet on the host. Roles
    /// already present, whatever their state, are left alone.
    pub fn apply_assignments(&self, assignments: &BTreeMap<String, Vec<Assignment>>) -> usize {
        let mut applied = 0;
        for (host_id, roles) in assignments {
            for a in roles {
                match self.machine.role_state(host_id, &a.role) {
                    Ok(RoleState::NotApplied) => {}
                    Ok(state) => {
                        info!(host_id = %host_id, role = %a.role, "[controller] assignment skipped, role is {state}");
                        continue;
                    }
                    Err(e) => {
                        warn!(host_id = %host_id, role = %a.role, "[controller] assignment skipped: {e}");
                        continue;
                    }
                }
                match self
                    .machine
                    .add_role(host_id, &a.role, a.version.as_deref(), a.params.clone())
                {
                    Ok(_) => applied += 1,
                    Err(e) => warn!(host_id = %host_id, role = %a.role, "[controller] assignment failed: {e}"),
                }
            }
        }
        if applied > 0 {
            self.waker.wake();
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookRegistry;
    use crate::notifier::NullNotifier;
    use crate::roles::{RoleCatalog, RoleDefinition};
    use crate::store::MemoryRoleStore;
    use crate::transport::ConfigMaster;
    use serde_json::json;

    fn controller() -> Controller {
        let def: RoleDefinition =
            serde_json::from_value(json!({"name": "web", "version": "1.0", "apps": {}})).unwrap();
        let machine = RoleStateMachine::new(
            Arc::new(MemoryRoleStore::new()),
            Arc::new(ConfigMaster::new()),
            Arc::new(RoleCatalog::new(vec![def]).unwrap()),
            Arc::new(HookRegistry::new()),
            Arc::new(NullNotifier),
        );
        Controller::new(Arc::new(machine), PollerWaker::default())
    }

    #[test]
    fn test_apply_assignments_skips_existing_and_unknown() {
        let ctl = controller();
        let assignments = BTreeMap::from([
            (
                "h1".to_string(),
                vec![
                    Assignment {
                        role: "web".into(),
                        version: None,
                        params: BTreeMap::new(),
                    },
                    Assignment {
                        role: "ghost".into(),
                        version: None,
                        params: BTreeMap::new(),
                    },
                ],
            ),
            (
                "h2".to_string(),
                vec![Assignment {
                    role: "web".into(),
                    version: Some("1.0".into()),
                    params: BTreeMap::new(),
                }],
            ),
        ]);

        assert_eq!(ctl.apply_assignments(&assignments), 2);
        // second run: both already in START_APPLY
        assert_eq!(ctl.apply_assignments(&assignments), 0);
        assert_eq!(
            ctl.machine().role_state("h2", "web").unwrap(),
            RoleState::StartApply
        );
    }

    #[test]
    fn test_delete_role_conflict_surfaces() {
        let ctl = controller();
        ctl.add_role("h1", "web", None, BTreeMap::new()).unwrap();
        assert!(matches!(
            ctl.delete_role("h1", "web"),
            Err(RoleError::RoleUpdateConflict { .. })
        ));
        assert!(ctl.delete_host("h1").is_err());
    }
}
