//! Health probes for managed services

use crate::process::{RunError, run_bounded};
use crate::service::{HealthCheck, HealthCheckKind, ServiceSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Outcome of a single health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum HealthResult {
    /// The check passed
    Healthy,
    /// The check completed and failed
    Unhealthy(String),
    /// The check did not complete within its timeout
    TimedOut,
}

impl HealthResult {
    /// Whether the check passed.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthResult::Healthy)
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            HealthResult::Healthy => None,
            HealthResult::Unhealthy(reason) => Some(reason),
            HealthResult::TimedOut => Some("timed out"),
        }
    }
}

impl From<Result<(), ProbeError>> for HealthResult {
    fn from(outcome: Result<(), ProbeError>) -> Self {
        match outcome {
            Ok(()) => HealthResult::Healthy,
            Err(ProbeError::Timeout(_)) => HealthResult::TimedOut,
            Err(err) => HealthResult::Unhealthy(err.to_string()),
        }
    }
}

impl fmt::Display for HealthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthResult::Healthy => f.write_str("healthy"),
            HealthResult::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
            HealthResult::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Why a probe did not pass.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// TCP connection refused, reset or unroutable
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    /// HTTP answered with an unexpected status
    #[error("{0}")]
    Status(u16),
    /// HTTP transport failure
    #[error("request failed: {0}")]
    Http(String),
    /// Command exited with an unexpected code, `None` when killed by a signal
    #[error("{}", describe_exit(.0))]
    ExitCode(Option<i32>),
    /// Command could not be run
    #[error("{0}")]
    Command(String),
    /// No answer within the check's timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Executes health checks. Implementations must be side-effect free with
/// respect to the supervisor and bounded by the check's timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Runs one check against `spec`.
    async fn check(&self, spec: &ServiceSpec) -> HealthResult;
}

/// Probe that performs real TCP, HTTP and command checks.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    http: reqwest::Client,
}

impl SystemProbe {
    /// Creates a probe with its own HTTP client. Fails when the TLS backend
    /// cannot be initialised.
    pub fn new() -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| ProbeError::Http(err.to_string()))?;
        Ok(Self { http })
    }

    /// Runs one check and reports why it did not pass.
    pub async fn probe(&self, check: &HealthCheck) -> Result<(), ProbeError> {
        let timeout = check.timeout;
        match &check.kind {
            HealthCheckKind::Tcp { host, port } => {
                match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), *port))).await
                {
                    Ok(Ok(_stream)) => Ok(()),
                    Ok(Err(err)) => Err(ProbeError::Connect(err)),
                    Err(_) => Err(ProbeError::Timeout(timeout)),
                }
            }
            HealthCheckKind::Http {
                url,
                expected_status,
            } => {
                let request = self.http.get(url).timeout(timeout).send();
                match tokio::time::timeout(timeout, request).await {
                    Ok(Ok(response)) => {
                        let status = response.status().as_u16();
                        if status == *expected_status {
                            Ok(())
                        } else {
                            Err(ProbeError::Status(status))
                        }
                    }
                    Ok(Err(err)) if err.is_timeout() => Err(ProbeError::Timeout(timeout)),
                    Ok(Err(err)) => Err(ProbeError::Http(err.to_string())),
                    Err(_) => Err(ProbeError::Timeout(timeout)),
                }
            }
            HealthCheckKind::Command {
                argv,
                expected_exit_code,
            } => match run_bounded(argv, timeout).await {
                Ok(Some(code)) if code == *expected_exit_code => Ok(()),
                Ok(code) => Err(ProbeError::ExitCode(code)),
                Err(RunError::Timeout { .. }) => Err(ProbeError::Timeout(timeout)),
                Err(err) => Err(ProbeError::Command(err.to_string())),
            },
        }
    }
}

#[async_trait]
impl HealthProbe for SystemProbe {
    async fn check(&self, spec: &ServiceSpec) -> HealthResult {
        let result = HealthResult::from(self.probe(&spec.health_check).await);
        if let Some(reason) = result.reason() {
            slog::debug!(slog_scope::logger(), "probe failed";
                "service" => &spec.name,
                "check" => %spec.health_check.kind,
                "reason" => reason
            );
        }
        result
    }
}
