//! Fleet kernel: role catalog, role state machine and the reconciliation
//! poller that drives every host toward the apps its roles declare.

pub mod config;
pub mod controller;
pub mod hooks;
pub mod notifier;
pub mod poller;
pub mod role_states;
pub mod roles;
pub mod state_machine;
pub mod store;
pub mod transport;

pub use controller::Controller;
pub use poller::{HostCache, PollerHandle, PollerWaker, ReconciliationPoller};
pub use role_states::RoleState;
pub use roles::{RoleCatalog, RoleDefinition};
pub use state_machine::{RoleError, RoleStateMachine};
