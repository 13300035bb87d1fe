//! Layered configuration for devstack.
//!
//! Settings are read from `.devstack/devstack.toml` and merged as
//! file → environment → CLI. Every field has a default, so an empty or
//! missing file yields the standard `docker compose watch` stack.
//!
//! # Configuration File Format
//!
//! ```toml
//! [supervisor]
//! log_capacity = 500
//! teardown_grace_secs = 10
//! event_buffer = 256
//!
//! [[processes]]
//! name = "docker-watch"
//! command = "docker"
//! args = ["compose", "watch"]
//! lock_marker = "Watch enabled"
//! services = ["web-server", "api-server", "sync-server", "postgres", "redis", "cron"]
//!
//! [services.cron]
//! required = false
//! ready_markers = ["cron daemon started"]
//! ```

use crate::readiness::{ReadinessTable, Service};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".devstack";
pub const CONFIG_FILE: &str = "devstack.toml";

/// Supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Lines kept per process
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Seconds between SIGTERM and SIGKILL during teardown
    #[serde(default = "default_teardown_grace_secs")]
    pub teardown_grace_secs: u64,
    /// Depth of the output channels between readers, supervisors and the UI
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_log_capacity() -> usize {
    500
}

fn default_teardown_grace_secs() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    256
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            teardown_grace_secs: default_teardown_grace_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// One supervised process of the launch plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Output line that means the process finished its job, whatever its exit code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_marker: Option<String>,
    /// Services whose readiness is reported in this process's output
    #[serde(default)]
    pub services: Vec<Service>,
}

impl ProcessSpec {
    /// The default plan: one `docker compose watch` reporting on every service.
    pub fn docker_watch() -> Self {
        Self {
            name: "docker-watch".to_string(),
            command: "docker".to_string(),
            args: vec!["compose".to_string(), "watch".to_string()],
            cwd: None,
            env: BTreeMap::new(),
            lock_marker: Some("Watch enabled".to_string()),
            services: Service::ALL.to_vec(),
        }
    }
}

/// Per-service overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOverride {
    /// Whether DOCKER_READY waits for this service (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Extra markers on top of the built-in ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_markers: Vec<String>,
}

fn default_processes() -> Vec<ProcessSpec> {
    vec![ProcessSpec::docker_watch()]
}

/// Root of `devstack.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevstackToml {
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default = "default_processes")]
    pub processes: Vec<ProcessSpec>,
    /// Keyed by service key (e.g. `web-server`); checked when parsing
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,
}

impl Default for DevstackToml {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSection::default(),
            processes: default_processes(),
            services: BTreeMap::new(),
        }
    }
}

impl DevstackToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(content).context("Failed to parse devstack.toml")?;
        for key in parsed.services.keys() {
            key.parse::<Service>()
                .with_context(|| format!("Invalid [services.{}] section", key))?;
        }
        Ok(parsed)
    }

    /// Overrides keyed by parsed service; unknown keys are skipped.
    pub fn service_overrides(&self) -> impl Iterator<Item = (Service, &ServiceOverride)> + '_ {
        self.services
            .iter()
            .filter_map(|(key, overrides)| key.parse::<Service>().ok().map(|s| (s, overrides)))
    }

    /// Load `devstack.toml` from `config_dir`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize devstack.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Built-in readiness table extended with configured markers.
    pub fn readiness_table(&self) -> ReadinessTable {
        let mut table = ReadinessTable::default();
        for (service, overrides) in self.service_overrides() {
            table.extend(service, overrides.ready_markers.iter().cloned());
        }
        table
    }

    /// Services that must be ready before DOCKER_READY.
    pub fn required_services(&self) -> BTreeSet<Service> {
        let optional: BTreeSet<Service> = self
            .service_overrides()
            .filter(|(_, overrides)| overrides.required == Some(false))
            .map(|(service, _)| service)
            .collect();
        Service::ALL
            .into_iter()
            .filter(|service| !optional.contains(service))
            .collect()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.processes.is_empty() {
            warnings.push("No [[processes]] configured; nothing will be launched".to_string());
        }
        if self.supervisor.log_capacity == 0 {
            warnings.push("supervisor.log_capacity is 0; it will be raised to 1".to_string());
        }

        let mut names = HashSet::new();
        for process in &self.processes {
            if process.command.trim().is_empty() {
                warnings.push(format!("Process '{}' has an empty command", process.name));
            }
            if !names.insert(process.name.as_str()) {
                warnings.push(format!("Process name '{}' is used more than once", process.name));
            }
            if let Some(marker) = &process.lock_marker
                && marker.is_empty()
            {
                warnings.push(format!(
                    "Process '{}' has an empty lock_marker, which matches nothing",
                    process.name
                ));
            }
        }

        let covered: BTreeSet<Service> = self
            .processes
            .iter()
            .flat_map(|p| p.services.iter().copied())
            .collect();
        for service in self.required_services() {
            if !covered.contains(&service) {
                warnings.push(format!(
                    "Required service '{}' is not reported by any process; DOCKER_READY will never be reached",
                    service
                ));
            }
        }

        warnings
    }
}

fn env_override<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Unified runtime configuration.
///
/// It merges settings from:
/// 1. devstack.toml
/// 2. Environment variables (`DEVSTACK_LOG_CAPACITY`, `DEVSTACK_TEARDOWN_GRACE_SECS`)
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct DevstackConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: DevstackToml,
    pub verbose: bool,
    pub cli_log_capacity: Option<usize>,
    pub cli_teardown_grace_secs: Option<u64>,
}

impl DevstackConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = DevstackToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
            cli_log_capacity: None,
            cli_teardown_grace_secs: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        log_capacity: Option<usize>,
        teardown_grace_secs: Option<u64>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_log_capacity = log_capacity;
        config.cli_teardown_grace_secs = teardown_grace_secs;
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }

    /// Lines kept per process (CLI → env → file).
    pub fn log_capacity(&self) -> usize {
        self.cli_log_capacity
            .or_else(|| env_override("DEVSTACK_LOG_CAPACITY"))
            .unwrap_or(self.toml.supervisor.log_capacity)
    }

    /// Grace period before SIGKILL during teardown (CLI → env → file).
    pub fn teardown_grace(&self) -> Duration {
        let secs = self
            .cli_teardown_grace_secs
            .or_else(|| env_override("DEVSTACK_TEARDOWN_GRACE_SECS"))
            .unwrap_or(self.toml.supervisor.teardown_grace_secs);
        Duration::from_secs(secs)
    }

    pub fn event_buffer(&self) -> usize {
        self.toml.supervisor.event_buffer.max(1)
    }

    /// Launch plan with working directories resolved against the project.
    pub fn processes(&self) -> Vec<ProcessSpec> {
        self.toml
            .processes
            .iter()
            .cloned()
            .map(|mut spec| {
                spec.cwd = Some(match spec.cwd {
                    Some(cwd) if cwd.is_absolute() => cwd,
                    Some(cwd) => self.project_dir.join(cwd),
                    None => self.project_dir.clone(),
                });
                spec
            })
            .collect()
    }

    pub fn readiness_table(&self) -> ReadinessTable {
        self.toml.readiness_table()
    }

    pub fn required_services(&self) -> BTreeSet<Service> {
        self.toml.required_services()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_yields_defaults() {
        let toml = DevstackToml::parse("").unwrap();
        assert_eq!(toml.supervisor.log_capacity, 500);
        assert_eq!(toml.supervisor.teardown_grace_secs, 10);
        assert_eq!(toml.processes, vec![ProcessSpec::docker_watch()]);
        assert_eq!(toml.required_services().len(), Service::ALL.len());
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[supervisor]
log_capacity = 50
teardown_grace_secs = 3

[[processes]]
name = "db"
command = "postgres"
args = ["-D", "data"]
cwd = "infra"
services = ["postgres"]

[[processes]]
name = "cache"
command = "redis-server"
services = ["redis"]

[services.cron]
required = false

[services.redis]
ready_markers = ["redis is up"]
"#;
        let toml = DevstackToml::parse(content).unwrap();
        assert_eq!(toml.supervisor.log_capacity, 50);
        assert_eq!(toml.supervisor.event_buffer, 256);
        assert_eq!(toml.processes.len(), 2);
        assert_eq!(toml.processes[0].services, vec![Service::Postgres]);
        assert!(!toml.required_services().contains(&Service::Cron));
        assert!(toml.readiness_table().matches(Service::Redis, "redis is up"));
    }

    #[test]
    fn test_validate_reports_uncovered_required_service() {
        let content = r#"
[[processes]]
name = "cache"
command = "redis-server"
services = ["redis"]
"#;
        let toml = DevstackToml::parse(content).unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("'postgres'")));
        assert!(!warnings.iter().any(|w| w.contains("'redis'")));
    }

    #[test]
    fn test_validate_duplicate_names_and_empty_command() {
        let content = r#"
[[processes]]
name = "x"
command = ""
services = ["web-server", "api-server", "sync-server", "postgres", "redis", "cron"]

[[processes]]
name = "x"
command = "true"
"#;
        let warnings = DevstackToml::parse(content).unwrap().validate();
        assert!(warnings.iter().any(|w| w.contains("empty command")));
        assert!(warnings.iter().any(|w| w.contains("more than once")));
    }

    #[test]
    fn test_unknown_service_key_is_rejected() {
        let content = r#"
[services.mysql]
required = true
"#;
        assert!(DevstackToml::parse(content).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let toml = DevstackToml::default();
        toml.save(&path).unwrap();
        let loaded = DevstackToml::load(&path).unwrap();
        assert_eq!(loaded.processes, toml.processes);
    }

    #[test]
    fn test_processes_resolve_cwd_against_project() {
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_FILE),
            r#"
[[processes]]
name = "web"
command = "yarn"
cwd = "web-server"
services = ["web-server"]
"#,
        )
        .unwrap();
        let config = DevstackConfig::new(dir.path().to_path_buf()).unwrap();
        let processes = config.processes();
        assert_eq!(
            processes[0].cwd,
            Some(dir.path().canonicalize().unwrap().join("web-server"))
        );
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("DEVSTACK_LOG_CAPACITY").ok();
        unsafe { std::env::set_var("DEVSTACK_LOG_CAPACITY", "42") };

        let dir = tempdir().unwrap();
        let from_env = DevstackConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(from_env.log_capacity(), 42);

        let from_cli =
            DevstackConfig::with_cli_args(dir.path().to_path_buf(), false, Some(7), None).unwrap();
        assert_eq!(from_cli.log_capacity(), 7);

        unsafe { std::env::remove_var("DEVSTACK_LOG_CAPACITY") };
        assert_eq!(from_env.log_capacity(), 500);

        if let Some(value) = saved {
            unsafe { std::env::set_var("DEVSTACK_LOG_CAPACITY", value) };
        }
    }

    #[test]
    fn test_teardown_grace_from_cli() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let config =
            DevstackConfig::with_cli_args(dir.path().to_path_buf(), true, None, Some(2)).unwrap();
        assert_eq!(config.teardown_grace(), Duration::from_secs(2));
        assert!(config.verbose);
    }
}
