//! Aggregated status reporting
//!
//! The runtime publishes a fresh copy of every service's state after each
//! change. [`StatusReporter`] reads those copies; it never touches live state
//! and never blocks the runtime, so it can be polled at any rate.

use crate::probe::{HealthProbe, HealthResult};
use crate::registry::Registry;
use crate::types::{ServicePhase, ServiceSnapshot, TransitionEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Transitions kept in the published history
pub(crate) const TRANSITION_HISTORY: usize = 256;

/// Extra time a one-shot sweep gives each probe beyond its own timeout
const SWEEP_MARGIN: Duration = Duration::from_millis(500);

/// Overall verdict over every service that is not stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every service is healthy
    AllHealthy,
    /// Nothing is failing, but some services are still pending or starting
    Converging,
    /// At least one service is unhealthy, none failed
    Degraded,
    /// At least one service failed, or the supervisor halted
    Critical,
}

impl Verdict {
    /// Process exit code for this verdict; zero only for [`Verdict::AllHealthy`].
    pub fn exit_code(self) -> u8 {
        match self {
            Verdict::AllHealthy => 0,
            Verdict::Degraded => 1,
            Verdict::Critical => 2,
            Verdict::Converging => 3,
        }
    }

    /// Computes the verdict for a set of services.
    ///
    /// Stopped services are left out, so an empty or fully stopped set is
    /// vacuously [`Verdict::AllHealthy`]. A supervisor that has shut down is
    /// marked separately with [`AggregatedStatus::mark_stopped`].
    pub fn of(services: &[ServiceSnapshot], halted: bool) -> Self {
        let live = services.iter().filter(|s| s.phase != ServicePhase::Stopped);
        let mut all_healthy = true;
        let mut unhealthy = false;
        for service in live {
            match service.phase {
                ServicePhase::Failed => return Verdict::Critical,
                ServicePhase::Unhealthy => unhealthy = true,
                ServicePhase::Healthy => {}
                _ => all_healthy = false,
            }
        }
        if halted {
            Verdict::Critical
        } else if unhealthy {
            Verdict::Degraded
        } else if all_healthy {
            Verdict::AllHealthy
        } else {
            Verdict::Converging
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::AllHealthy => "ALL HEALTHY",
            Verdict::Converging => "CONVERGING",
            Verdict::Degraded => "DEGRADED",
            Verdict::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Point-in-time, read-only view of every managed service plus a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStatus {
    /// Supervisor name
    pub supervisor: String,
    /// When the view was taken
    pub taken_at: DateTime<Utc>,
    /// Overall verdict
    pub verdict: Verdict,
    /// Services in declaration order
    pub services: Vec<ServiceSnapshot>,
    /// Set when the supervisor halted on an internal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    /// Set once the supervisor has shut down and supervises nothing
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stopped: bool,
}

impl AggregatedStatus {
    /// Builds a status and computes its verdict.
    pub fn from_services(
        supervisor: impl Into<String>,
        services: Vec<ServiceSnapshot>,
        halted: Option<String>,
    ) -> Self {
        let verdict = Verdict::of(&services, halted.is_some());
        Self {
            supervisor: supervisor.into(),
            taken_at: Utc::now(),
            verdict,
            services,
            halted,
            stopped: false,
        }
    }

    /// Marks the supervisor as shut down. Nothing is running any more, so the
    /// verdict becomes [`Verdict::Critical`] whatever the services report.
    pub fn mark_stopped(&mut self) {
        self.stopped = true;
        self.verdict = Verdict::Critical;
    }

    /// Looks up one service.
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Phase of one service.
    pub fn phase_of(&self, name: &str) -> Option<ServicePhase> {
        self.service(name).map(|s| s.phase)
    }

    /// Exit code for the status command.
    pub fn exit_code(&self) -> u8 {
        self.verdict.exit_code()
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parses a status previously written by [`Self::to_json`].
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Human-readable table.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: {} ({})",
            self.supervisor,
            self.verdict,
            self.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(reason) = &self.halted {
            let _ = writeln!(out, "halted: {}", reason);
        }
        if self.stopped {
            let _ = writeln!(out, "stopped: supervisor has shut down");
        }

        let width = self
            .services
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max("SERVICE".len());
        let _ = writeln!(
            out,
            "  {:<width$}  {:<9}  {:>8}  {:>7}  {:>8}  DETAIL",
            "SERVICE",
            "PHASE",
            "FAILURES",
            "RETRIES",
            "LATENCY",
            width = width
        );
        for service in &self.services {
            let latency = service
                .last_latency_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "  {:<width$}  {:<9}  {:>8}  {:>7}  {:>8}  {}",
                service.name,
                service.phase.to_string(),
                service.consecutive_failures,
                service.retry_count,
                latency,
                detail(service),
                width = width
            );
        }
        out
    }
}

impl fmt::Display for AggregatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_text())
    }
}

fn detail(service: &ServiceSnapshot) -> String {
    if let Some(failure) = &service.failure {
        return failure.to_string();
    }
    if !service.blocked_by.is_empty() {
        return format!("waiting for {}", service.blocked_by.join(", "));
    }
    match &service.last_result {
        Some(result) if !result.is_healthy() => result.to_string(),
        _ => String::new(),
    }
}

/// What the runtime publishes after every change
#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub supervisor: String,
    pub services: Vec<ServiceSnapshot>,
    pub transitions: VecDeque<TransitionEvent>,
    pub halted: Option<String>,
    pub stopped: bool,
}

/// Read-only access to a running supervisor's state.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    rx: watch::Receiver<Published>,
}

impl StatusReporter {
    pub(crate) fn new(rx: watch::Receiver<Published>) -> Self {
        Self { rx }
    }

    /// Current status with a freshly computed verdict.
    pub fn snapshot(&self) -> AggregatedStatus {
        let published = self.rx.borrow();
        let mut status = AggregatedStatus::from_services(
            published.supervisor.clone(),
            published.services.clone(),
            published.halted.clone(),
        );
        if published.stopped {
            status.mark_stopped();
        }
        status
    }

    /// Most recent committed transitions, oldest first.
    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.rx.borrow().transitions.iter().cloned().collect()
    }

    /// Waits for the next published change. Returns false once the
    /// supervisor is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Waits until `predicate` holds and returns the matching status. If the
    /// supervisor goes away first, returns the last status it published.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> AggregatedStatus
    where
        F: FnMut(&AggregatedStatus) -> bool,
    {
        loop {
            let status = self.snapshot();
            if predicate(&status) || !self.changed().await {
                return status;
            }
        }
    }
}

/// Probes every service once, concurrently, without any lifecycle action.
///
/// Each probe is bounded by its own timeout plus a small margin, so this
/// always returns. Services come back either healthy or unhealthy.
pub async fn sweep<P: HealthProbe>(
    supervisor: &str,
    registry: &Registry,
    probe: Arc<P>,
) -> AggregatedStatus {
    let mut probes = JoinSet::new();
    for (position, spec) in registry.iter().enumerate() {
        let spec = Arc::clone(spec);
        let probe = Arc::clone(&probe);
        probes.spawn(async move {
            let bound = spec.health_check.timeout + SWEEP_MARGIN;
            let started = Instant::now();
            let result = tokio::time::timeout(bound, probe.check(&spec))
                .await
                .unwrap_or(HealthResult::TimedOut);
            (position, result, started.elapsed())
        });
    }

    let mut results = vec![None; registry.len()];
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((position, result, latency)) => results[position] = Some((result, latency)),
            Err(err) => {
                slog::error!(slog_scope::logger(), "probe task failed"; "error" => %err);
            }
        }
    }

    let now = Utc::now();
    let services = registry
        .iter()
        .zip(results)
        .map(|(spec, outcome)| {
            let (result, latency) = outcome.unwrap_or_else(|| {
                (
                    HealthResult::Unhealthy("probe task failed".to_string()),
                    Duration::ZERO,
                )
            });
            let healthy = result.is_healthy();
            ServiceSnapshot {
                name: spec.name.clone(),
                phase: if healthy {
                    ServicePhase::Healthy
                } else {
                    ServicePhase::Unhealthy
                },
                consecutive_failures: u32::from(!healthy),
                retry_count: 0,
                last_checked_at: Some(now),
                last_transition_at: now,
                last_result: Some(result),
                last_latency_ms: Some(latency.as_millis() as u64),
                blocked_by: Vec::new(),
                failure: None,
            }
        })
        .collect();

    AggregatedStatus::from_services(supervisor, services, None)
}
