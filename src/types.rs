//! Common types shared by the supervisor, the probes and the status reporter

use crate::probe::HealthResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Service identifier type
pub type ServiceName = String;

/// Lifecycle phase of a managed service.
///
/// `Pending -> Starting -> Healthy <-> Unhealthy -> Failed`, with `Stopped`
/// reachable from any phase on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    /// Waiting for every dependency to become healthy
    Pending,
    /// Started, waiting for the first healthy probe
    Starting,
    /// Last probe succeeded
    Healthy,
    /// Last probe failed, restart scheduled
    Unhealthy,
    /// Terminal until an operator restart
    Failed,
    /// Shut down by the supervisor
    Stopped,
}

impl ServicePhase {
    /// Whether the service has been launched and not yet stopped.
    pub fn is_launched(self) -> bool {
        matches!(
            self,
            ServicePhase::Starting
                | ServicePhase::Healthy
                | ServicePhase::Unhealthy
                | ServicePhase::Failed
        )
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServicePhase::Pending => "pending",
            ServicePhase::Starting => "starting",
            ServicePhase::Healthy => "healthy",
            ServicePhase::Unhealthy => "unhealthy",
            ServicePhase::Failed => "failed",
            ServicePhase::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Why a service ended up in [`ServicePhase::Failed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// No healthy probe within the startup timeout
    StartupTimeout {
        /// The configured timeout, in milliseconds
        after_ms: u64,
    },
    /// Consecutive failures exceeded the restart policy
    RetriesExhausted {
        /// Consecutive failed probes at the time of failure
        failures: u32,
        /// Reason reported by the last failed probe
        last_error: String,
    },
}

impl FailureCause {
    pub(crate) fn startup_timeout(after: Duration) -> Self {
        FailureCause::StartupTimeout {
            after_ms: after.as_millis() as u64,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::StartupTimeout { after_ms } => {
                write!(f, "not healthy within startup timeout of {}ms", after_ms)
            }
            FailureCause::RetriesExhausted {
                failures,
                last_error,
            } => {
                write!(
                    f,
                    "gave up after {} consecutive failures (last: {})",
                    failures, last_error
                )
            }
        }
    }
}

/// Point-in-time copy of one service's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// Service name
    pub name: ServiceName,
    /// Current phase
    pub phase: ServicePhase,
    /// Failed probes since the last healthy observation
    pub consecutive_failures: u32,
    /// Restarts scheduled since the last reset
    pub retry_count: u32,
    /// When the last probe result arrived
    pub last_checked_at: Option<DateTime<Utc>>,
    /// When the phase last changed
    pub last_transition_at: DateTime<Utc>,
    /// Result of the last probe
    pub last_result: Option<HealthResult>,
    /// Wall-clock duration of the last probe
    pub last_latency_ms: Option<u64>,
    /// Dependencies that are not healthy yet (only for pending services)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<ServiceName>,
    /// Set once the service is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
}

/// A committed phase change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// Supervisor-wide sequence number, strictly increasing
    pub seq: u64,
    /// Service that changed phase
    pub service: ServiceName,
    /// Phase before the change
    pub from: ServicePhase,
    /// Phase after the change
    pub to: ServicePhase,
    /// When the change was committed
    pub at: DateTime<Utc>,
    /// Human-readable cause, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
