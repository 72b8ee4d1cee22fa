/**
 * RECONCILIATION POLLER - Boucle de fond qui fait converger la flotte
 *
 * CYCLE :
 * 1. Liste des hôtes + statut de chacun via le transport
 * 2. Hôtes inconnus → bucket "non autorisés" (purgés après timeout d'absence)
 * 3. Hôtes avec rôles → avance des états transitoires (reprise après crash)
 * 4. Réactivité : âge du statut vs seuil (long si converging/retrying)
 * 5. Convergence : satisfait + ok → *_CONVERGED ; non satisfait → re-push ;
 *    failed plus récent que le dernier push → *_ERROR
 * 6. Un statut antérieur au dernier push est ignoré pour la convergence
 *
 * Un échec sur un hôte est journalisé et n'arrête jamais le cycle.
 * Le cycle tourne dans `spawn_blocking` : store et transport sont synchrones.
 */

use crate::config::PollerConf;
use crate::state_machine::{RoleError, RoleStateMachine};
use fleet_common::{is_satisfied_by, HostStatus, HostStatusKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnauthorizedHost {
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Default)]
struct CacheState {
    unauthorized: BTreeMap<String, UnauthorizedHost>,
    last_status: BTreeMap<String, HostStatusKind>,
}

/// Poller-owned view of hosts that have no role yet and of the last status
/// each host reported. Cleared when the poller stops.
#[derive(Debug, Default)]
pub struct HostCache {
    state: Mutex<CacheState>,
}

impl HostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time the host is seen.
    pub fn note_unauthorized(&self, host_id: &str, now: OffsetDateTime) -> bool {
        let mut state = self.state.lock();
        match state.unauthorized.get_mut(host_id) {
            Some(entry) => {
                entry.last_seen = now;
                false
            }
            None => {
                state.unauthorized.insert(
                    host_id.to_string(),
                    UnauthorizedHost {
                        first_seen: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn authorize(&self, host_id: &str) -> bool {
        self.state.lock().unauthorized.remove(host_id).is_some()
    }

    /// Drops hosts not seen for longer than `timeout`.
    pub fn purge_unauthorized(&self, now: OffsetDateTime, timeout: Duration) -> Vec<String> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .unauthorized
            .iter()
            .filter(|(_, h)| now - h.last_seen > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.unauthorized.remove(id);
        }
        expired
    }

    pub fn unauthorized(&self) -> BTreeMap<String, UnauthorizedHost> {
        self.state.lock().unauthorized.clone()
    }

    pub fn record_status(&self, host_id: &str, status: HostStatusKind) -> Option<HostStatusKind> {
        self.state.lock().last_status.insert(host_id.to_string(), status)
    }

    pub fn last_status(&self, host_id: &str) -> Option<HostStatusKind> {
        self.state.lock().last_status.get(host_id).copied()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.unauthorized.clear();
        state.last_status.clear();
    }
}

pub struct ReconciliationPoller {
    machine: Arc<RoleStateMachine>,
    cache: Arc<HostCache>,
    conf: PollerConf,
}

impl ReconciliationPoller {
    pub fn new(machine: Arc<RoleStateMachine>, cache: Arc<HostCache>, conf: PollerConf) -> Self {
        Self {
            machine,
            cache,
            conf,
        }
    }

    pub fn cache(&self) -> &Arc<HostCache> {
        &self.cache
    }

    pub fn run_cycle(&self) -> Result<(), RoleError> {
        self.run_cycle_at(OffsetDateTime::now_utc())
    }

    pub fn run_cycle_at(&self, now: OffsetDateTime) -> Result<(), RoleError> {
        let store = self.machine.store();
        let transport = self.machine.transport();

        let reported = transport.list_host_ids()?;
        let mut statuses = BTreeMap::new();
        for host_id in &reported {
            match transport.get_host_status(host_id) {
                Ok(Some(status)) => {
                    statuses.insert(host_id.clone(), status);
                }
                Ok(None) => {}
                Err(e) => warn!(host_id = %host_id, "[poller] status unavailable: {e}"),
            }
        }

        let managed: BTreeSet<String> = store
            .list_associations()?
            .into_iter()
            .map(|a| a.host_id)
            .collect();
        self.track_unauthorized(&reported, &managed, now);

        for host_id in &managed {
            if let Err(e) = self.machine.advance_transient_states(host_id) {
                warn!(host_id = %host_id, "[poller] advance failed: {e}");
            }
            if let Err(e) = self.reconcile_host(host_id, statuses.get(host_id), now) {
                warn!(host_id = %host_id, "[poller] reconcile failed: {e}");
            }
        }
        debug!(hosts = reported.len(), managed = managed.len(), "[poller] cycle done");
        Ok(())
    }

    fn track_unauthorized(&self, reported: &[String], managed: &BTreeSet<String>, now: OffsetDateTime) {
        let notifier = self.machine.notifier();
        for host_id in reported {
            if managed.contains(host_id) {
                self.cache.authorize(host_id);
            } else if self.cache.note_unauthorized(host_id, now) {
                info!(host_id = %host_id, "[poller] new unauthorized host");
                notifier.publish("create", "unauthorized_host", host_id);
            }
        }
        let timeout = Duration::from_secs(self.conf.unauthorized_timeout_secs);
        for host_id in self.cache.purge_unauthorized(now, timeout) {
            info!(host_id = %host_id, "[poller] unauthorized host gone, purged");
            notifier.publish("delete", "unauthorized_host", &host_id);
        }
    }

    fn reconcile_host(
        &self,
        host_id: &str,
        status: Option<&HostStatus>,
        now: OffsetDateTime,
    ) -> Result<(), RoleError> {
        let responding = status.is_some_and(|s| self.is_responding(s, now));
        let mut flipped = false;
        // deauth may have removed the host during the advance step
        let Some(host) = self.machine.update_host(host_id, |host| {
            flipped = host.responding != responding;
            host.responding = responding;
            if let Some(s) = status.filter(|s| s.status != HostStatusKind::Missing) {
                host.last_status_time = Some(s.timestamp);
                host.role_status = Some(s.status);
                if s.info.is_some() {
                    host.info = s.info.clone();
                }
            }
        })?
        else {
            return Ok(());
        };
        if flipped {
            info!(host_id, responding, "[poller] responsiveness changed");
            self.machine.notifier().publish("update", "host", host_id);
        }

        let Some(status) = status else {
            return Ok(());
        };
        self.cache.record_status(host_id, status.status);

        if host.last_push_time.is_some_and(|pushed| status.timestamp < pushed) {
            debug!(host_id, "[poller] status predates last push, ignored");
            return Ok(());
        }

        let expected = self.machine.expected_apps(host_id)?;
        let satisfied = is_satisfied_by(Some(&expected), &status.apps);
        match status.status {
            HostStatusKind::Ok if satisfied => {
                if self.machine.on_host_converged(host_id)? > 0 {
                    self.machine.advance_transient_states(host_id)?;
                }
            }
            HostStatusKind::Ok | HostStatusKind::Missing if !satisfied => {
                debug!(host_id, "[poller] host out of sync, re-pushing");
                self.machine.transport().push_config(host_id, &expected)?;
            }
            HostStatusKind::Failed => {
                if self.machine.on_host_failed(host_id)? > 0 {
                    warn!(host_id, "[poller] host reported failed, roles moved to error");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_responding(&self, status: &HostStatus, now: OffsetDateTime) -> bool {
        if status.status == HostStatusKind::Missing {
            return false;
        }
        let threshold = if status.status.is_in_progress() {
            self.conf.converging_threshold_secs
        } else {
            self.conf.steady_threshold_secs
        };
        now - status.timestamp <= Duration::from_secs(threshold)
    }
}

/// Non-blocking nudge for the poller; clones share the same signal.
#[derive(Clone, Default)]
pub struct PollerWaker(Arc<Notify>);

impl PollerWaker {
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

pub struct PollerHandle {
    waker: PollerWaker,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn waker(&self) -> PollerWaker {
        self.waker.clone()
    }

    pub fn wake(&self) {
        self.waker.wake();
    }

    /// Lets the running cycle finish, then clears the host cache.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!("[poller] task ended abnormally: {e}");
        }
    }
}

pub fn spawn(poller: Arc<ReconciliationPoller>) -> PollerHandle {
    let waker = PollerWaker::default();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let notify = waker.0.clone();
    let interval = poller.conf.interval();

    let task = tokio::spawn(async move {
        info!("[poller] started, interval {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notify.notified() => debug!("[poller] woken"),
                _ = stop_rx.changed() => break,
            }
            let cycle = poller.clone();
            match tokio::task::spawn_blocking(move || cycle.run_cycle()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[poller] cycle aborted: {e}"),
                Err(e) => error!("[poller] cycle panicked: {e}"),
            }
            if *stop_rx.borrow() {
                break;
            }
        }
        poller.cache.clear();
        info!("[poller] stopped");
    });

    PollerHandle {
        waker,
        stop_tx,
        task,
    }
}
