//! TOML configuration
//!
//! ```toml
//! [supervisor]
//! name = "edge"
//! poll_interval_ms = 5000
//! cascade = "stop"
//!
//! [[service]]
//! name = "db"
//! health_check = { kind = "tcp", host = "127.0.0.1", port = 5432 }
//!
//! [[service]]
//! name = "api"
//! depends_on = ["db"]
//! health_check = { kind = "http", url = "http://127.0.0.1:8080/health" }
//! restart_policy = { max_retries = 5, backoff_base_ms = 500 }
//! lifecycle = { start = ["systemctl", "start", "api"], stop = ["systemctl", "stop", "api"] }
//! ```
//!
//! Durations are integer milliseconds. Everything except service names and
//! the fields a check kind needs has a default.

use crate::registry::{Registry, ValidationError};
use crate::restart::RestartPolicy;
use crate::service::{HealthCheck, Lifecycle, ServiceSpec};
use crate::supervisor::{CascadePolicy, SupervisorSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// `[supervisor]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Name shown in logs and status output
    #[serde(default = "default_supervisor_name")]
    pub name: String,

    /// Default interval between health checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time in-flight probes get to finish on shutdown
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,

    /// Healthy time after which a service's retry count resets
    #[serde(default = "default_stabilization_window_ms")]
    pub stabilization_window_ms: u64,

    /// What happens to dependents of a failed service
    #[serde(default)]
    pub cascade: CascadePolicy,
}

/// One `[[service]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,

    /// Longest wait for the first healthy probe
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Overrides `supervisor.poll_interval_ms` for this service
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Tcp,
    Http,
    Command,
}

/// `health_check` table. Which fields are required depends on `kind`:
/// `host` and `port` for tcp, `url` for http, `argv` for command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub kind: CheckKind,

    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub url: Option<String>,
    /// Defaults to 200
    #[serde(default)]
    pub expected_status: Option<u16>,

    #[serde(default)]
    pub argv: Option<Vec<String>>,
    /// Defaults to 0
    #[serde(default)]
    pub expected_exit_code: Option<i32>,

    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicyConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub start: Option<Vec<String>>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub kill: Option<Vec<String>>,

    /// Upper bound for each lifecycle command
    #[serde(default = "default_lifecycle_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_supervisor_name() -> String {
    String::from("ash-warden")
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_period_ms() -> u64 {
    10_000
}

fn default_stabilization_window_ms() -> u64 {
    60_000
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_check_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_lifecycle_timeout_ms() -> u64 {
    30_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: default_supervisor_name(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            stabilization_window_ms: default_stabilization_window_ms(),
            cascade: CascadePolicy::default(),
        }
    }
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start: None,
            stop: None,
            kill: None,
            timeout_ms: default_lifecycle_timeout_ms(),
        }
    }
}

impl Config {
    /// Reads and parses a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Checks values that parse but make no sense, such as zero timeouts.
    /// Name and dependency rules are checked by [`Config::registry`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let supervisor = &self.supervisor;
        if supervisor.poll_interval_ms == 0 {
            return Err(invalid("supervisor.poll_interval_ms must be greater than zero"));
        }
        if supervisor.shutdown_grace_period_ms == 0 {
            return Err(invalid(
                "supervisor.shutdown_grace_period_ms must be greater than zero",
            ));
        }
        if supervisor.name.trim().is_empty() {
            return Err(invalid("supervisor.name must not be empty"));
        }

        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }

    /// Builds the validated service registry.
    pub fn registry(&self) -> Result<Registry, ConfigError> {
        self.validate()?;
        let specs = self
            .services
            .iter()
            .map(ServiceConfig::to_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Registry::load(specs)?)
    }

    /// Builds the supervisor specification, including its registry.
    pub fn supervisor_spec(&self) -> Result<SupervisorSpec, ConfigError> {
        let registry = self.registry()?;
        let supervisor = &self.supervisor;
        Ok(SupervisorSpec::new(supervisor.name.clone(), registry)
            .with_poll_interval(Duration::from_millis(supervisor.poll_interval_ms))
            .with_shutdown_grace_period(Duration::from_millis(supervisor.shutdown_grace_period_ms))
            .with_stabilization_window(Duration::from_millis(supervisor.stabilization_window_ms))
            .with_cascade(supervisor.cascade))
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.name;
        if self.startup_timeout_ms == 0 {
            return Err(invalid(format!("{name}: startup_timeout_ms must be greater than zero")));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(invalid(format!("{name}: poll_interval_ms must be greater than zero")));
        }
        if self.health_check.timeout_ms == 0 {
            return Err(invalid(format!(
                "{name}: health_check.timeout_ms must be greater than zero"
            )));
        }

        let policy = &self.restart_policy;
        if policy.backoff_base_ms > policy.backoff_max_ms {
            return Err(invalid(format!(
                "{name}: restart_policy.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                policy.backoff_base_ms, policy.backoff_max_ms
            )));
        }

        let lifecycle = &self.lifecycle;
        if lifecycle.timeout_ms == 0 {
            return Err(invalid(format!(
                "{name}: lifecycle.timeout_ms must be greater than zero"
            )));
        }
        for (action, argv) in [
            ("start", &lifecycle.start),
            ("stop", &lifecycle.stop),
            ("kill", &lifecycle.kill),
        ] {
            if argv.as_ref().is_some_and(Vec::is_empty) {
                return Err(invalid(format!("{name}: lifecycle.{action} must not be empty")));
            }
        }
        Ok(())
    }

    fn to_spec(&self) -> Result<ServiceSpec, ConfigError> {
        let policy = &self.restart_policy;
        let lifecycle = &self.lifecycle;

        let mut spec = ServiceSpec::new(self.name.clone(), self.health_check.to_check(&self.name)?)
            .with_restart_policy(RestartPolicy::new(
                policy.max_retries,
                Duration::from_millis(policy.backoff_base_ms),
                Duration::from_millis(policy.backoff_max_ms),
            ))
            .with_startup_timeout(Duration::from_millis(self.startup_timeout_ms))
            .with_lifecycle(Lifecycle {
                start: lifecycle.start.clone(),
                stop: lifecycle.stop.clone(),
                kill: lifecycle.kill.clone(),
                timeout: Duration::from_millis(lifecycle.timeout_ms),
            });
        if let Some(interval) = self.poll_interval_ms {
            spec = spec.with_poll_interval(Duration::from_millis(interval));
        }
        for dependency in &self.depends_on {
            spec = spec.depends_on(dependency.clone());
        }
        Ok(spec)
    }
}

impl HealthCheckConfig {
    fn to_check(&self, service: &str) -> Result<HealthCheck, ConfigError> {
        let check = match self.kind {
            CheckKind::Tcp => {
                let host = self
                    .host
                    .as_deref()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid(format!("{service}: tcp check needs a host")))?;
                let port = self
                    .port
                    .filter(|p| *p != 0)
                    .ok_or_else(|| invalid(format!("{service}: tcp check needs a port")))?;
                HealthCheck::tcp(host, port)
            }
            CheckKind::Http => {
                let url = self
                    .url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| invalid(format!("{service}: http check needs a url")))?;
                HealthCheck::http(url, self.expected_status.unwrap_or(200))
            }
            CheckKind::Command => {
                let argv = self
                    .argv
                    .as_ref()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| invalid(format!("{service}: command check needs argv")))?;
                HealthCheck::command(argv.iter().cloned(), self.expected_exit_code.unwrap_or(0))
            }
        };
        Ok(check.with_timeout(Duration::from_millis(self.timeout_ms)))
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
