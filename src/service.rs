//! Service specification and builder

use crate::restart::RestartPolicy;
use crate::types::ServiceName;
use std::fmt;
use std::time::Duration;

/// What a health check talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckKind {
    /// Healthy iff a TCP connection can be established
    Tcp {
        /// Host name or address
        host: String,
        /// Port number
        port: u16,
    },
    /// Healthy iff `GET url` answers with `expected_status`
    Http {
        /// Full URL, including scheme
        url: String,
        /// Status code that counts as healthy
        expected_status: u16,
    },
    /// Healthy iff the command exits with `expected_exit_code`
    Command {
        /// Program followed by its arguments
        argv: Vec<String>,
        /// Exit code that counts as healthy
        expected_exit_code: i32,
    },
}

impl fmt::Display for HealthCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckKind::Tcp { host, port } => write!(f, "tcp {}:{}", host, port),
            HealthCheckKind::Http {
                url,
                expected_status,
            } => write!(f, "http GET {} == {}", url, expected_status),
            HealthCheckKind::Command {
                argv,
                expected_exit_code,
            } => write!(f, "exec `{}` == {}", argv.join(" "), expected_exit_code),
        }
    }
}

/// A health check procedure bounded by a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Check procedure
    pub kind: HealthCheckKind,
    /// Upper bound for a single check
    pub timeout: Duration,
}

impl HealthCheck {
    /// Default timeout for a single check
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// TCP connect check.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: HealthCheckKind::Tcp {
                host: host.into(),
                port,
            },
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// HTTP GET check.
    pub fn http(url: impl Into<String>, expected_status: u16) -> Self {
        Self {
            kind: HealthCheckKind::Http {
                url: url.into(),
                expected_status,
            },
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// External command check.
    pub fn command<I, S>(argv: I, expected_exit_code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: HealthCheckKind::Command {
                argv: argv.into_iter().map(Into::into).collect(),
                expected_exit_code,
            },
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Sets the timeout for a single check.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Commands used to drive the service's own lifecycle.
///
/// A missing command means that part of the lifecycle is managed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    /// Starts the service
    pub start: Option<Vec<String>>,
    /// Stops the service gracefully
    pub stop: Option<Vec<String>>,
    /// Terminates the service forcefully
    pub kill: Option<Vec<String>>,
    /// Upper bound for each lifecycle command
    pub timeout: Duration,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            start: None,
            stop: None,
            kill: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Immutable description of one managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: ServiceName,
    /// Services that must be healthy before this one starts, in declaration order
    pub depends_on: Vec<ServiceName>,
    /// How health is checked
    pub health_check: HealthCheck,
    /// How failures are retried
    pub restart_policy: RestartPolicy,
    /// Longest wait for the first healthy probe
    pub startup_timeout: Duration,
    /// Per-service poll interval, overriding the supervisor's
    pub poll_interval: Option<Duration>,
    /// Lifecycle commands
    pub lifecycle: Lifecycle,
}

impl ServiceSpec {
    /// Default startup timeout
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a service specification with default policies.
    pub fn new(name: impl Into<String>, health_check: HealthCheck) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            health_check,
            restart_policy: RestartPolicy::default(),
            startup_timeout: Self::DEFAULT_STARTUP_TIMEOUT,
            poll_interval: None,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Adds a start-after dependency. Repeated names are kept once.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
        self
    }

    /// Sets the restart policy.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Sets the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Overrides the poll interval for this service.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the lifecycle commands.
    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}
