/**
 * ROLE STATE MACHINE - Cycle de vie d'un rôle sur un hôte
 *
 * RÔLE : Seul point d'écriture de `current_state`. Les appels opérateur
 * (add_role / delete_role) ne font qu'entrer dans la machine ; le poller la
 * fait avancer via `advance_transient_states`.
 *
 * FONCTIONNEMENT :
 * - Toutes les transitions passent par un verrou unique (corps courts)
 * - Chaque transition est validée par la table de `role_states`
 * - Un échec (hook, transport, store) laisse l'état au dernier engagement
 *   ou le route vers le rollback / l'état *_ERROR prévu
 * - Chaque transition engagée publie une notification de changement
 *
 * UTILITÉ : Reprise après crash gratuite : un rôle garé en PRE_AUTH au
 * redémarrage est poussé au cycle suivant sans nouvel appel API.
 */

use crate::hooks::{HookContext, HookError, HookRegistry, RoleEvent};
use crate::notifier::ChangeNotifier;
use crate::role_states::RoleState;
use crate::roles::RoleCatalog;
use crate::store::{HostRecord, RoleAssociation, RoleChange, RoleStore, StoreError};
use crate::transport::{ConfigTransport, TransportError};
use fleet_common::{AppsConfig, ConfigError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("role {role} on {host_id} is {state}, operation not allowed")]
    RoleUpdateConflict {
        host_id: String,
        role: String,
        state: RoleState,
    },
    #[error("role {role} (version {version}) not in catalog")]
    RoleNotFound { role: String, version: String },
    #[error("{event} hook failed for {role} on {host_id}: {source}")]
    Hook {
        host_id: String,
        role: String,
        event: RoleEvent,
        #[source]
        source: HookError,
    },
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

pub struct RoleStateMachine {
    store: Arc<dyn RoleStore>,
    transport: Arc<dyn ConfigTransport>,
    catalog: Arc<RoleCatalog>,
    hooks: Arc<HookRegistry>,
    notifier: Arc<dyn ChangeNotifier>,
    lock: Mutex<()>,
}

impl RoleStateMachine {
    pub fn new(
        store: Arc<dyn RoleStore>,
        transport: Arc<dyn ConfigTransport>,
        catalog: Arc<RoleCatalog>,
        hooks: Arc<HookRegistry>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            store,
            transport,
            catalog,
            hooks,
            notifier,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RoleStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn ConfigTransport> {
        &self.transport
    }

    pub fn notifier(&self) -> &Arc<dyn ChangeNotifier> {
        &self.notifier
    }

    /// NotApplied when no row exists.
    pub fn role_state(&self, host_id: &str, role: &str) -> Result<RoleState, RoleError> {
        Ok(self
            .store
            .get_association(host_id, role)?
            .map_or(RoleState::NotApplied, |a| a.current_state))
    }

    /// Assigns `role` to a host (NOT_APPLIED / AUTH_ERROR → START_APPLY) or
    /// edits an applied one (APPLIED → START_EDIT). `version` defaults to the
    /// catalog's latest.
    pub fn add_role(
        &self,
        host_id: &str,
        role: &str,
        version: Option<&str>,
        params: BTreeMap<String, String>,
    ) -> Result<RoleState, RoleError> {
        let _guard = self.lock.lock();

        let def = match version {
            Some(v) => self.catalog.get(role, v),
            None => self.catalog.latest(role),
        }
        .ok_or_else(|| RoleError::RoleNotFound {
            role: role.to_string(),
            version: version.unwrap_or("latest").to_string(),
        })?;
        def.render(host_id, &params)?;

        let existing = self.store.get_association(host_id, role)?;
        let state = existing.as_ref().map_or(RoleState::NotApplied, |a| a.current_state);
        let (assoc, next) = match (existing, state) {
            (None, _) => (
                RoleAssociation {
                    host_id: host_id.to_string(),
                    role_name: role.to_string(),
                    role_version: def.version.clone(),
                    current_state: RoleState::NotApplied,
                    params,
                    pending: None,
                    deauth_from: None,
                },
                RoleState::StartApply,
            ),
            (Some(mut assoc), RoleState::AuthError) => {
                assoc.role_version = def.version.clone();
                assoc.params = params;
                assoc.pending = None;
                (assoc, RoleState::StartApply)
            }
            (Some(mut assoc), RoleState::Applied) => {
                assoc.pending = Some(RoleChange {
                    role_version: def.version.clone(),
                    params,
                });
                (assoc, RoleState::StartEdit)
            }
            (Some(_), state) => return Err(conflict(host_id, role, state)),
        };

        self.ensure_host(host_id)?;
        self.commit(assoc, next)?;
        Ok(next)
    }

    /// APPLIED / AUTH_ERROR / DEAUTH_ERROR → START_DEAUTH.
    pub fn delete_role(&self, host_id: &str, role: &str) -> Result<RoleState, RoleError> {
        let _guard = self.lock.lock();
        self.delete_role_locked(host_id, role)
    }

    /// Starts deauth for every role of the host. Stops at the first conflict;
    /// roles already moved to START_DEAUTH stay there.
    pub fn delete_host(&self, host_id: &str) -> Result<Vec<String>, RoleError> {
        let _guard = self.lock.lock();
        let assocs = self.store.associations_for_host(host_id)?;
        if assocs.is_empty() {
            self.forget_host(host_id)?;
            return Ok(Vec::new());
        }
        let mut started = Vec::new();
        for assoc in assocs {
            if assoc.current_state == RoleState::StartDeauth {
                continue;
            }
            self.delete_role_locked(host_id, &assoc.role_name)?;
            started.push(assoc.role_name);
        }
        Ok(started)
    }

    fn delete_role_locked(&self, host_id: &str, role: &str) -> Result<RoleState, RoleError> {
        let mut assoc = self
            .store
            .get_association(host_id, role)?
            .ok_or_else(|| conflict(host_id, role, RoleState::NotApplied))?;
        match assoc.current_state {
            state @ (RoleState::Applied | RoleState::AuthError | RoleState::DeauthError) => {
                assoc.deauth_from = Some(state);
                self.commit(assoc, RoleState::StartDeauth)?;
                Ok(RoleState::StartDeauth)
            }
            state => Err(conflict(host_id, role, state)),
        }
    }

    /// Moves every role of the host forward until each one waits for external
    /// input. All roles are attempted; the first error is returned.
    pub fn advance_transient_states(&self, host_id: &str) -> Result<(), RoleError> {
        let roles: Vec<String> = self
            .store
            .associations_for_host(host_id)?
            .into_iter()
            .map(|a| a.role_name)
            .collect();

        let mut first_err = None;
        for role in roles {
            loop {
                let step = {
                    let _guard = self.lock.lock();
                    self.step(host_id, &role)
                };
                match step {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(host_id, role = %role, "[roles] advance failed: {e}");
                        first_err.get_or_insert(e);
                        break;
                    }
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// AUTH_CONVERGING → AUTH_CONVERGED, DEAUTH_CONVERGING → DEAUTH_CONVERGED.
    pub fn on_host_converged(&self, host_id: &str) -> Result<usize, RoleError> {
        self.settle(host_id, RoleState::AuthConverged, RoleState::DeauthConverged)
    }

    /// AUTH_CONVERGING → AUTH_ERROR, DEAUTH_CONVERGING → DEAUTH_ERROR.
    pub fn on_host_failed(&self, host_id: &str) -> Result<usize, RoleError> {
        self.settle(host_id, RoleState::AuthError, RoleState::DeauthError)
    }

    fn settle(&self, host_id: &str, auth: RoleState, deauth: RoleState) -> Result<usize, RoleError> {
        let _guard = self.lock.lock();
        let mut moved = 0;
        for assoc in self.store.associations_for_host(host_id)? {
            let next = match assoc.current_state {
                RoleState::AuthConverging => auth,
                RoleState::DeauthConverging => deauth,
                _ => continue,
            };
            self.commit(assoc, next)?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Read-modify-write of a host row under the transition lock, so it
    /// cannot race a push stamp or a forget. A missing row is left missing.
    pub fn update_host(
        &self,
        host_id: &str,
        update: impl FnOnce(&mut HostRecord),
    ) -> Result<Option<HostRecord>, RoleError> {
        let _guard = self.lock.lock();
        let Some(mut host) = self.store.get_host(host_id)? else {
            return Ok(None);
        };
        let before = host.clone();
        update(&mut host);
        if host != before {
            self.store.put_host(&host)?;
        }
        Ok(Some(host))
    }

    /// Merged app config of every authed role on the host, rendered with the
    /// committed version and params. Later role names win on app collisions.
    pub fn expected_apps(&self, host_id: &str) -> Result<AppsConfig, RoleError> {
        let mut apps = AppsConfig::new();
        for assoc in self.store.associations_for_host(host_id)? {
            if !assoc.current_state.is_authed() {
                continue;
            }
            let def = self
                .catalog
                .get(&assoc.role_name, &assoc.role_version)
                .ok_or_else(|| RoleError::RoleNotFound {
                    role: assoc.role_name.clone(),
                    version: assoc.role_version.clone(),
                })?;
            apps.extend(def.render(host_id, &assoc.params)?);
        }
        Ok(apps)
    }

    /// One auto-advance step for (host, role). `Ok(true)` when a transition
    /// was committed.
    fn step(&self, host_id: &str, role: &str) -> Result<bool, RoleError> {
        let Some(mut assoc) = self.store.get_association(host_id, role)? else {
            return Ok(false);
        };
        match assoc.current_state {
            RoleState::StartApply => {
                match self.run_hook(&assoc, RoleEvent::OnAuth) {
                    Ok(()) => self.commit(assoc, RoleState::PreAuth)?,
                    Err(e) => {
                        self.commit(assoc, RoleState::NotApplied)?;
                        return Err(e);
                    }
                }
            }
            RoleState::StartEdit => {
                let mut target = assoc.clone();
                if let Some(change) = target.pending.take() {
                    target.role_version = change.role_version;
                    target.params = change.params;
                }
                match self.run_hook(&target, RoleEvent::OnAuth) {
                    Ok(()) => self.commit(target, RoleState::PreAuth)?,
                    Err(e) => {
                        assoc.pending = None;
                        self.commit(assoc, RoleState::Applied)?;
                        return Err(e);
                    }
                }
            }
            RoleState::PreAuth => {
                self.push_expected(host_id)?;
                self.commit(assoc, RoleState::AuthConverging)?;
            }
            RoleState::AuthConverged => match self.run_hook(&assoc, RoleEvent::OnAuthConverged) {
                Ok(()) => self.commit(assoc, RoleState::Applied)?,
                Err(e) => {
                    self.commit(assoc, RoleState::AuthError)?;
                    return Err(e);
                }
            },
            RoleState::StartDeauth => {
                let origin = assoc.deauth_from.take().unwrap_or(RoleState::Applied);
                match self.run_hook(&assoc, RoleEvent::OnDeauth) {
                    Ok(()) => self.commit(assoc, RoleState::PreDeauth)?,
                    Err(e) => {
                        self.commit(assoc, origin)?;
                        return Err(e);
                    }
                }
            }
            RoleState::PreDeauth => {
                self.push_expected(host_id)?;
                self.commit(assoc, RoleState::DeauthConverging)?;
            }
            RoleState::DeauthConverged => {
                match self.run_hook(&assoc, RoleEvent::OnDeauthConverged) {
                    Ok(()) => self.commit(assoc, RoleState::NotApplied)?,
                    Err(e) => {
                        self.commit(assoc, RoleState::DeauthError)?;
                        return Err(e);
                    }
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Pushes the new desired state and stamps the host's last push time.
    /// A transport failure leaves both untouched.
    fn push_expected(&self, host_id: &str) -> Result<(), RoleError> {
        let apps = self.expected_apps(host_id)?;
        self.transport.push_config(host_id, &apps)?;
        let mut host = self
            .store
            .get_host(host_id)?
            .unwrap_or_else(|| HostRecord::new(host_id));
        host.last_push_time = Some(OffsetDateTime::now_utc());
        self.store.put_host(&host)?;
        info!(host_id, apps = apps.len(), "[roles] config pushed");
        Ok(())
    }

    fn run_hook(&self, assoc: &RoleAssociation, event: RoleEvent) -> Result<(), RoleError> {
        let ctx = HookContext {
            host_id: &assoc.host_id,
            role_name: &assoc.role_name,
            role_version: &assoc.role_version,
            event,
            params: &assoc.params,
        };
        self.hooks.run(&ctx).map_err(|source| RoleError::Hook {
            host_id: assoc.host_id.clone(),
            role: assoc.role_name.clone(),
            event,
            source,
        })
    }

    fn commit(&self, mut assoc: RoleAssociation, next: RoleState) -> Result<(), RoleError> {
        let from = assoc.current_state;
        if !from.can_transition_to(next) {
            return Err(conflict(&assoc.host_id, &assoc.role_name, from));
        }
        let object_id = format!("{}/{}", assoc.host_id, assoc.role_name);
        if next == RoleState::NotApplied {
            self.store.delete_association(&assoc.host_id, &assoc.role_name)?;
            self.notifier.publish("delete", "role", &object_id);
            if self.store.associations_for_host(&assoc.host_id)?.is_empty() {
                self.forget_host(&assoc.host_id)?;
            }
        } else {
            assoc.current_state = next;
            self.store.put_association(&assoc)?;
            self.notifier.publish("update", "role", &object_id);
        }
        info!(
            host_id = %assoc.host_id,
            role = %assoc.role_name,
            "[roles] {} → {}", from, next
        );
        Ok(())
    }

    fn ensure_host(&self, host_id: &str) -> Result<(), RoleError> {
        if self.store.get_host(host_id)?.is_none() {
            self.store.put_host(&HostRecord::new(host_id))?;
            self.notifier.publish("create", "host", host_id);
            debug!(host_id, "[roles] host row created");
        }
        Ok(())
    }

    fn forget_host(&self, host_id: &str) -> Result<(), RoleError> {
        if self.store.get_host(host_id)?.is_some() {
            self.store.delete_host(host_id)?;
            self.notifier.publish("delete", "host", host_id);
            info!(host_id, "[roles] host has no roles left, removed");
        }
        Ok(())
    }
}

fn conflict(host_id: &str, role: &str, state: RoleState) -> RoleError {
    RoleError::RoleUpdateConflict {
        host_id: host_id.to_string(),
        role: role.to_string(),
        state,
    }
}
