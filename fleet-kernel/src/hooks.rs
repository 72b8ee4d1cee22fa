/**
 * HOOKS - Table des callbacks exécutés aux étapes clés d'un rôle
 *
 * RÔLE : Associe (rôle, événement) → liste ordonnée de hooks. Résolue au
 * démarrage depuis la configuration typée (`HookSpec`) ou enregistrée par code.
 *
 * ÉVÉNEMENTS : on_auth, on_auth_converged, on_deauth, on_deauth_converged.
 * Un rôle sans hook pour un événement réussit toujours.
 *
 * COMMANDES : template découpé avec shell-words, placeholders {host_id} {role}
 * {version} {event} + paramètres du rôle, exécuté avec une limite de temps.
 */

use parking_lot::RwLock;
use process_control::{ChildExt, Control};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleEvent {
    OnAuth,
    OnAuthConverged,
    OnDeauth,
    OnDeauthConverged,
}

impl RoleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleEvent::OnAuth => "on_auth",
            RoleEvent::OnAuthConverged => "on_auth_converged",
            RoleEvent::OnDeauth => "on_deauth",
            RoleEvent::OnDeauthConverged => "on_deauth_converged",
        }
    }
}

impl fmt::Display for RoleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("invalid hook command: {0}")]
    InvalidCommand(String),
    #[error("hook command failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("hook command exited with {0}")]
    Exit(String),
    #[error("hook command timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Failed(String),
}

pub struct HookContext<'a> {
    pub host_id: &'a str,
    pub role_name: &'a str,
    pub role_version: &'a str,
    pub event: RoleEvent,
    pub params: &'a BTreeMap<String, String>,
}

pub trait RoleHook: Send + Sync {
    fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError>;
}

/// Declarative hook, as written in the role catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookSpec {
    Log {
        #[serde(default)]
        message: Option<String>,
    },
    Command {
        command: String,
        #[serde(default = "default_hook_timeout")]
        timeout_secs: u64,
    },
}

fn default_hook_timeout() -> u64 {
    60
}

impl HookSpec {
    pub fn build(&self) -> Arc<dyn RoleHook> {
        match self {
            HookSpec::Log { message } => Arc::new(LogHook {
                message: message.clone(),
            }),
            HookSpec::Command {
                command,
                timeout_secs,
            } => Arc::new(CommandHook {
                template: command.clone(),
                timeout: Duration::from_secs(*timeout_secs),
            }),
        }
    }
}

pub struct LogHook {
    message: Option<String>,
}

impl RoleHook for LogHook {
    fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        info!(
            host_id = ctx.host_id,
            role = ctx.role_name,
            version = ctx.role_version,
            event = %ctx.event,
            "{}",
            self.message.as_deref().unwrap_or("role hook")
        );
        Ok(())
    }
}

pub struct CommandHook {
    template: String,
    timeout: Duration,
}

impl CommandHook {
    fn render(&self, ctx: &HookContext<'_>) -> String {
        let mut cmd = self
            .template
            .replace("{host_id}", ctx.host_id)
            .replace("{role}", ctx.role_name)
            .replace("{version}", ctx.role_version)
            .replace("{event}", ctx.event.as_str());
        for (key, value) in ctx.params {
            cmd = cmd.replace(&format!("{{{key}}}"), value);
        }
        cmd
    }
}

impl RoleHook for CommandHook {
    fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        let rendered = self.render(ctx);
        let parts =
            shell_words::split(&rendered).map_err(|e| HookError::InvalidCommand(e.to_string()))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(HookError::InvalidCommand("empty command".into()));
        };
        debug!(host_id = ctx.host_id, role = ctx.role_name, event = %ctx.event, "running hook: {}", rendered);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let status = child
            .controlled()
            .time_limit(self.timeout)
            .terminate_for_timeout()
            .wait()?;
        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(HookError::Exit(status.to_string())),
            None => Err(HookError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// (role, event) → hooks, run in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<(String, RoleEvent), Vec<Arc<dyn RoleHook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, role: &str, event: RoleEvent, hook: Arc<dyn RoleHook>) {
        self.hooks
            .write()
            .entry((role.to_string(), event))
            .or_default()
            .push(hook);
    }

    pub fn register_specs(&self, role: &str, specs: &BTreeMap<RoleEvent, Vec<HookSpec>>) {
        for (event, list) in specs {
            for spec in list {
                self.register(role, *event, spec.build());
            }
        }
    }

    /// Stops at the first failing hook.
    pub fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        let hooks = self
            .hooks
            .read()
            .get(&(ctx.role_name.to_string(), ctx.event))
            .cloned()
            .unwrap_or_default();
        for hook in hooks {
            hook.run(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize, bool);

    impl RoleHook for Counting {
        fn run(&self, _ctx: &HookContext<'_>) -> Result<(), HookError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                Err(HookError::Failed("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn ctx<'a>(event: RoleEvent, params: &'a BTreeMap<String, String>) -> HookContext<'a> {
        HookContext {
            host_id: "h1",
            role_name: "web",
            role_version: "1.0",
            event,
            params,
        }
    }

    #[test]
    fn test_unregistered_event_succeeds() {
        let registry = HookRegistry::new();
        let params = BTreeMap::new();
        assert!(registry.run(&ctx(RoleEvent::OnAuth, &params)).is_ok());
    }

    #[test]
    fn test_first_failure_stops_the_chain() {
        let registry = HookRegistry::new();
        let failing = Arc::new(Counting(AtomicUsize::new(0), true));
        let after = Arc::new(Counting(AtomicUsize::new(0), false));
        registry.register("web", RoleEvent::OnDeauth, failing.clone());
        registry.register("web", RoleEvent::OnDeauth, after.clone());

        let params = BTreeMap::new();
        assert!(registry.run(&ctx(RoleEvent::OnDeauth, &params)).is_err());
        assert_eq!(failing.0.load(Ordering::SeqCst), 1);
        assert_eq!(after.0.load(Ordering::SeqCst), 0);
        assert!(registry.run(&ctx(RoleEvent::OnAuth, &params)).is_ok());
    }

    #[test]
    fn test_command_template_rendering() {
        let hook = CommandHook {
            template: "notify --host {host_id} --role {role}@{version} --on {event} --zone {zone}".into(),
            timeout: Duration::from_secs(1),
        };
        let params = BTreeMap::from([("zone".to_string(), "eu".to_string())]);
        assert_eq!(
            hook.render(&ctx(RoleEvent::OnAuthConverged, &params)),
            "notify --host h1 --role web@1.0 --on on_auth_converged --zone eu"
        );
    }

    #[test]
    fn test_spec_from_yaml() {
        let specs: BTreeMap<RoleEvent, Vec<HookSpec>> = serde_yaml::from_str(
            "on_auth:\n  - type: command\n    command: /bin/true\n  - type: log\n",
        )
        .unwrap();
        assert_eq!(
            specs[&RoleEvent::OnAuth][0],
            HookSpec::Command {
                command: "/bin/true".into(),
                timeout_secs: 60
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_command_hook_exit_status() {
        let params = BTreeMap::new();
        let ok = HookSpec::Command { command: "true".into(), timeout_secs: 5 }.build();
        assert!(ok.run(&ctx(RoleEvent::OnAuth, &params)).is_ok());

        let fail = HookSpec::Command { command: "false".into(), timeout_secs: 5 }.build();
        assert!(matches!(
            fail.run(&ctx(RoleEvent::OnAuth, &params)),
            Err(HookError::Exit(_))
        ));
    }
}
