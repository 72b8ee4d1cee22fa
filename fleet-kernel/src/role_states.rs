/**
 * ROLE STATES - États d'un rôle sur un hôte et transitions autorisées
 *
 * RÔLE : Définit les 13 états d'une association (hôte, rôle) et la table des
 * transitions légales. Toute transition passe par `can_transition_to`.
 *
 * FONCTIONNEMENT :
 * - NotApplied n'est jamais stocké : l'absence de ligne vaut NotApplied
 * - Branche auth : StartApply/StartEdit → PreAuth → AuthConverging → AuthConverged → Applied
 * - Branche deauth : StartDeauth → PreDeauth → DeauthConverging → DeauthConverged → (suppression)
 * - AuthError / DeauthError : états terminaux d'échec, sortie par une action opérateur
 *
 * UTILITÉ : Source unique de vérité pour la machine d'états et le poller.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleState {
    NotApplied,
    StartApply,
    PreAuth,
    AuthConverging,
    AuthConverged,
    AuthError,
    Applied,
    StartEdit,
    StartDeauth,
    PreDeauth,
    DeauthConverging,
    DeauthConverged,
    DeauthError,
}

use RoleState::*;

impl RoleState {
    pub const ALL: [RoleState; 13] = [
        NotApplied,
        StartApply,
        PreAuth,
        AuthConverging,
        AuthConverged,
        AuthError,
        Applied,
        StartEdit,
        StartDeauth,
        PreDeauth,
        DeauthConverging,
        DeauthConverged,
        DeauthError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotApplied => "not-applied",
            StartApply => "start-apply",
            PreAuth => "pre-auth",
            AuthConverging => "auth-converging",
            AuthConverged => "auth-converged",
            AuthError => "auth-error",
            Applied => "applied",
            StartEdit => "start-edit",
            StartDeauth => "start-deauth",
            PreDeauth => "pre-deauth",
            DeauthConverging => "deauth-converging",
            DeauthConverged => "deauth-converged",
            DeauthError => "deauth-error",
        }
    }

    pub fn valid_next(&self) -> &'static [RoleState] {
        match self {
            NotApplied => &[StartApply],
            StartApply => &[PreAuth, NotApplied],
            PreAuth => &[AuthConverging],
            AuthConverging => &[AuthConverged, AuthError],
            AuthConverged => &[Applied, AuthError],
            // StartDeauth: operator drops a role that failed to apply
            AuthError => &[StartApply, StartDeauth],
            Applied => &[StartEdit, StartDeauth],
            StartEdit => &[PreAuth, Applied],
            // rollback goes back to wherever the deauth started
            StartDeauth => &[PreDeauth, Applied, AuthError, DeauthError],
            PreDeauth => &[DeauthConverging],
            DeauthConverging => &[DeauthConverged, DeauthError],
            DeauthConverged => &[NotApplied, DeauthError],
            DeauthError => &[StartDeauth],
        }
    }

    pub fn can_transition_to(&self, next: RoleState) -> bool {
        self.valid_next().contains(&next)
    }

    /// The role's apps belong in the host's expected config.
    pub fn is_authed(&self) -> bool {
        matches!(
            self,
            Applied | StartApply | StartEdit | PreAuth | AuthConverging | AuthConverged | AuthError
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, AuthError | DeauthError)
    }

    pub fn is_converging(&self) -> bool {
        matches!(self, AuthConverging | DeauthConverging)
    }

    /// Parked mid-transition; the poller moves it forward without new input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StartApply | StartEdit | PreAuth | AuthConverged | StartDeauth | PreDeauth | DeauthConverged
        )
    }
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid role state '{0}'")]
pub struct InvalidState(pub String);

impl FromStr for RoleState {
    type Err = InvalidState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| InvalidState(s.to_string()))
    }
}
