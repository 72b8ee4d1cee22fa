//! System backend: rpm/dpkg packages, per-app config scripts, systemd units
//!
//! Apps are the installed packages whose name starts with the configured
//! prefix. Each app may ship `<config_script_dir>/<app>/config` supporting
//! `--get-config`, `--set-config <json>` and `--get-services`; apps without a
//! script have an empty config and one service named after the package.
//! Every external command runs under a time limit.

use super::memory::version_from_url;
use super::{AppCache, AppDb, AppError, InstalledApp, LocalPackage, ServiceTarget};
use fleet_common::AppSpec;
use parking_lot::Mutex;
use process_control::{ChildExt, Control};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Auto,
    Rpm,
    Deb,
}

impl PackageFormat {
    fn resolve(self) -> PackageFormat {
        match self {
            PackageFormat::Auto if Path::new("/usr/bin/dpkg").exists()
                && !Path::new("/usr/bin/rpm").exists() =>
            {
                PackageFormat::Deb
            }
            PackageFormat::Auto => PackageFormat::Rpm,
            other => other,
        }
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct SystemAppDb {
    package_prefix: String,
    config_script_dir: PathBuf,
    format: PackageFormat,
    timeout: Duration,
}

impl SystemAppDb {
    pub fn new(
        package_prefix: impl Into<String>,
        config_script_dir: impl Into<PathBuf>,
        format: PackageFormat,
        timeout: Duration,
    ) -> Self {
        let format = format.resolve();
        info!(?format, "using system package manager");
        Self {
            package_prefix: package_prefix.into(),
            config_script_dir: config_script_dir.into(),
            format,
            timeout,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, AppError> {
        debug!(program, ?args, "running command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let output = child
            .controlled_with_output()
            .time_limit(self.timeout)
            .terminate_for_timeout()
            .wait()?;
        match output {
            Some(out) => Ok(CommandOutput {
                success: out.status.success(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }),
            None => Err(AppError::Timeout {
                command: format!("{program} {}", args.join(" ")),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    fn config_script(&self, app: &str) -> Option<PathBuf> {
        let script = self.config_script_dir.join(app).join("config");
        script.exists().then_some(script)
    }

    fn list_packages(&self) -> Result<Vec<(String, String)>, AppError> {
        let pattern = format!("{}*", self.package_prefix);
        let out = match self.format {
            PackageFormat::Deb => self.run(
                "dpkg-query",
                &["-W", "-f", "${Package} ${Version} ${Status}\\n", &pattern],
            )?,
            _ => self.run(
                "rpm",
                &["-qa", "--queryformat", "%{NAME} %{VERSION}-%{RELEASE}\\n", &pattern],
            )?,
        };
        // dpkg-query exits non-zero when nothing matches
        if !out.success && self.format == PackageFormat::Rpm {
            return Err(AppError::Package {
                app: pattern,
                reason: out.stderr.trim().to_string(),
            });
        }

        let mut packages = Vec::new();
        for line in out.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(name), Some(version)) = (fields.next(), fields.next()) else {
                continue;
            };
            if self.format == PackageFormat::Deb && !line.ends_with("install ok installed") {
                continue;
            }
            packages.push((name.to_string(), version.to_string()));
        }
        Ok(packages)
    }

    fn read_config(&self, app: &str) -> Result<Map<String, Value>, AppError> {
        let Some(script) = self.config_script(app) else {
            return Ok(Map::new());
        };
        let out = self.run(&script.to_string_lossy(), &["--get-config"])?;
        if !out.success {
            return Err(AppError::Config {
                app: app.to_string(),
                reason: out.stderr.trim().to_string(),
            });
        }
        match serde_json::from_str::<Value>(&out.stdout) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => Err(AppError::Config {
                app: app.to_string(),
                reason: "--get-config did not return a JSON object".into(),
            }),
        }
    }

    fn services(&self, app: &str) -> Result<Vec<String>, AppError> {
        let Some(script) = self.config_script(app) else {
            return Ok(vec![app.to_string()]);
        };
        let out = self.run(&script.to_string_lossy(), &["--get-services"])?;
        if !out.success {
            warn!(app, "--get-services failed, assuming single service");
            return Ok(vec![app.to_string()]);
        }
        match serde_json::from_str::<Value>(&out.stdout) {
            Ok(Value::Array(names)) => Ok(names
                .into_iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()),
            Ok(Value::Object(map)) => Ok(map.keys().cloned().collect()),
            _ => Ok(vec![app.to_string()]),
        }
    }

    fn is_active(&self, service: &str) -> Result<bool, AppError> {
        Ok(self.run("systemctl", &["is-active", "--quiet", service])?.success)
    }

    fn control_service(&self, app: &str, service: &str, running: bool) -> Result<(), AppError> {
        let action = if running { "start" } else { "stop" };
        let out = self.run("systemctl", &[action, service])?;
        if out.success {
            info!(app, service, action, "service state changed");
            Ok(())
        } else {
            Err(AppError::Service {
                app: app.to_string(),
                reason: format!("systemctl {action} {service}: {}", out.stderr.trim()),
            })
        }
    }
}

impl AppDb for SystemAppDb {
    fn query_installed(&self) -> Result<BTreeMap<String, InstalledApp>, AppError> {
        let mut apps = BTreeMap::new();
        for (name, version) in self.list_packages()? {
            let config = self.read_config(&name)?;
            let mut service_states = BTreeMap::new();
            for service in self.services(&name)? {
                let active = self.is_active(&service)?;
                service_states.insert(service, active);
            }
            apps.insert(
                name.clone(),
                InstalledApp {
                    name,
                    version,
                    config,
                    service_states,
                },
            );
        }
        Ok(apps)
    }

    fn install(&self, package: &LocalPackage) -> Result<(), AppError> {
        let path = package.path.to_string_lossy();
        let out = match self.format {
            PackageFormat::Deb => self.run("dpkg", &["-i", &path])?,
            _ => self.run("rpm", &["-U", "--force", &path])?,
        };
        if !out.success {
            return Err(AppError::Package {
                app: package.app.clone(),
                reason: out.stderr.trim().to_string(),
            });
        }
        info!(app = %package.app, version = %package.version, "package installed");
        Ok(())
    }

    fn uninstall(&self, app: &str) -> Result<(), AppError> {
        for service in self.services(app)? {
            if let Err(e) = self.control_service(app, &service, false) {
                warn!(app, service, "failed to stop service before removal: {}", e);
            }
        }
        let out = match self.format {
            PackageFormat::Deb => self.run("dpkg", &["-r", app])?,
            _ => self.run("rpm", &["-e", app])?,
        };
        if !out.success {
            return Err(AppError::Package {
                app: app.to_string(),
                reason: out.stderr.trim().to_string(),
            });
        }
        info!(app, "package removed");
        Ok(())
    }

    fn set_config(&self, app: &str, config: &Map<String, Value>) -> Result<(), AppError> {
        if config.is_empty() {
            return Ok(());
        }
        let script = self.config_script(app).ok_or_else(|| AppError::Config {
            app: app.to_string(),
            reason: "app has no config script".into(),
        })?;
        let json = serde_json::to_string(config).map_err(|e| AppError::Config {
            app: app.to_string(),
            reason: e.to_string(),
        })?;
        let out = self.run(&script.to_string_lossy(), &["--set-config", &json])?;
        if !out.success {
            return Err(AppError::Config {
                app: app.to_string(),
                reason: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn set_service_states(&self, app: &str, target: &ServiceTarget) -> Result<(), AppError> {
        let wanted = target.resolve(self.services(app)?);
        for (service, running) in wanted {
            if self.is_active(&service)? != running {
                self.control_service(app, &service, running)?;
            }
        }
        Ok(())
    }
}

/// Downloads packages over HTTP into a local cache directory.
pub struct HttpAppCache {
    cache_dir: PathBuf,
    timeout: Duration,
    // built on first use: the blocking client must not be created on a runtime thread
    client: Mutex<Option<reqwest::blocking::Client>>,
}

impl HttpAppCache {
    pub fn new(cache_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            timeout,
            client: Mutex::new(None),
        }
    }

    fn fetch(&self, url: &str, dest: &Path) -> Result<(), String> {
        let mut guard = self.client.lock();
        if guard.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| e.to_string())?;
            *guard = Some(client);
        }
        let Some(client) = guard.as_ref() else {
            return Err("http client unavailable".into());
        };
        let bytes = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(|e| e.to_string())?;

        std::fs::create_dir_all(&self.cache_dir).map_err(|e| e.to_string())?;
        let tmp = dest.with_extension("part");
        std::fs::write(&tmp, &bytes).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp, dest).map_err(|e| e.to_string())
    }
}

impl AppCache for HttpAppCache {
    fn download(&self, app: &str, spec: &AppSpec) -> Result<LocalPackage, AppError> {
        let fail = |reason: String| AppError::Download {
            app: app.to_string(),
            version: spec.version.clone(),
            reason,
        };
        let url = spec.url.as_deref().ok_or_else(|| fail("no url in app spec".into()))?;
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| fail(format!("cannot derive file name from {url}")))?;
        let dest = self.cache_dir.join(file_name);

        if dest.exists() {
            debug!(app, path = %dest.display(), "package already cached");
        } else {
            info!(app, url, "downloading package");
            self.fetch(url, &dest).map_err(fail)?;
        }

        Ok(LocalPackage {
            app: app.to_string(),
            version: version_from_url(app, url).unwrap_or_else(|| spec.version.clone()),
            path: dest,
        })
    }
}
