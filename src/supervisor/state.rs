//! Per-service state machine
//!
//! Every method is a synchronous transition applied by the runtime, which is
//! the only owner of [`ServiceState`]. Readers only ever see snapshots.

use crate::probe::HealthResult;
use crate::restart::RestartPolicy;
use crate::types::{FailureCause, ServiceName, ServicePhase, ServiceSnapshot};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// What the service's task does after reporting a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    /// Probe again after the delay
    Poll(Duration),
    /// Restart the service after the delay, then probe
    Restart(Duration),
    /// Stop probing
    Halt,
}

/// A phase change to be committed by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: ServicePhase,
    pub to: ServicePhase,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ServiceState {
    pub phase: ServicePhase,
    pub consecutive_failures: u32,
    pub retry_count: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub last_result: Option<HealthResult>,
    pub last_latency: Option<Duration>,
    pub failure: Option<FailureCause>,
    /// Identifies the task currently driving this service
    pub generation: u64,
    healthy_since: Option<Instant>,
}

impl ServiceState {
    pub(crate) fn new() -> Self {
        Self {
            phase: ServicePhase::Pending,
            consecutive_failures: 0,
            retry_count: 0,
            last_checked_at: None,
            last_transition_at: Utc::now(),
            last_result: None,
            last_latency: None,
            failure: None,
            generation: 0,
            healthy_since: None,
        }
    }

    fn enter(&mut self, to: ServicePhase, reason: Option<String>) -> Transition {
        let from = self.phase;
        self.phase = to;
        self.last_transition_at = Utc::now();
        Transition { from, to, reason }
    }

    /// `Pending -> Starting`. The caller checks that every dependency is healthy.
    pub(crate) fn launch(&mut self) -> Option<Transition> {
        if self.phase != ServicePhase::Pending {
            return None;
        }
        self.generation += 1;
        self.consecutive_failures = 0;
        self.healthy_since = None;
        Some(self.enter(ServicePhase::Starting, None))
    }

    /// Applies one probe result and decides what the task does next.
    pub(crate) fn observe(
        &mut self,
        result: HealthResult,
        latency: Duration,
        policy: &RestartPolicy,
        stabilization_window: Duration,
        interval: Duration,
        now: Instant,
    ) -> (Option<Transition>, Directive) {
        if !matches!(
            self.phase,
            ServicePhase::Starting | ServicePhase::Healthy | ServicePhase::Unhealthy
        ) {
            return (None, Directive::Halt);
        }

        self.last_checked_at = Some(Utc::now());
        self.last_latency = Some(latency);

        let outcome = if result.is_healthy() {
            self.consecutive_failures = 0;
            if self.phase == ServicePhase::Healthy {
                let stable = self
                    .healthy_since
                    .is_some_and(|since| now.duration_since(since) >= stabilization_window);
                if stable && self.retry_count > 0 {
                    self.retry_count = 0;
                }
                (None, Directive::Poll(interval))
            } else {
                self.healthy_since = Some(now);
                (
                    Some(self.enter(ServicePhase::Healthy, None)),
                    Directive::Poll(interval),
                )
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.healthy_since = None;
            let reason = result.reason().unwrap_or("unhealthy").to_string();

            if policy.is_exhausted(self.consecutive_failures) {
                let cause = FailureCause::RetriesExhausted {
                    failures: self.consecutive_failures,
                    last_error: reason,
                };
                let transition = self.enter(ServicePhase::Failed, Some(cause.to_string()));
                self.failure = Some(cause);
                (Some(transition), Directive::Halt)
            } else if self.phase == ServicePhase::Starting {
                (
                    None,
                    Directive::Poll(policy.backoff(self.consecutive_failures - 1)),
                )
            } else {
                let delay = policy.backoff(self.retry_count);
                self.retry_count = self.retry_count.saturating_add(1);
                let transition = (self.phase == ServicePhase::Healthy)
                    .then(|| self.enter(ServicePhase::Unhealthy, Some(reason)));
                (transition, Directive::Restart(delay))
            }
        };

        self.last_result = Some(result);
        outcome
    }

    /// `Starting -> Failed` when no healthy probe arrived in time.
    pub(crate) fn startup_expired(&mut self, timeout: Duration) -> Option<Transition> {
        if self.phase != ServicePhase::Starting {
            return None;
        }
        let cause = FailureCause::startup_timeout(timeout);
        let transition = self.enter(ServicePhase::Failed, Some(cause.to_string()));
        self.failure = Some(cause);
        Some(transition)
    }

    /// Back to `Pending` because a dependency failed.
    pub(crate) fn hold(&mut self, reason: String) -> Option<Transition> {
        if !matches!(
            self.phase,
            ServicePhase::Starting | ServicePhase::Healthy | ServicePhase::Unhealthy
        ) {
            return None;
        }
        self.generation += 1;
        self.healthy_since = None;
        Some(self.enter(ServicePhase::Pending, Some(reason)))
    }

    /// Operator restart: clears counters and failure, back to `Pending`.
    pub(crate) fn reset(&mut self) -> Option<Transition> {
        self.generation += 1;
        self.consecutive_failures = 0;
        self.retry_count = 0;
        self.failure = None;
        self.healthy_since = None;
        match self.phase {
            ServicePhase::Pending | ServicePhase::Stopped => None,
            _ => Some(self.enter(ServicePhase::Pending, Some("operator restart".to_string()))),
        }
    }

    /// Any phase `-> Stopped`.
    pub(crate) fn stop(&mut self) -> Option<Transition> {
        if self.phase == ServicePhase::Stopped {
            return None;
        }
        self.generation += 1;
        self.healthy_since = None;
        Some(self.enter(ServicePhase::Stopped, None))
    }

    pub(crate) fn snapshot(&self, name: &str, blocked_by: Vec<ServiceName>) -> ServiceSnapshot {
        ServiceSnapshot {
            name: name.to_string(),
            phase: self.phase,
            consecutive_failures: self.consecutive_failures,
            retry_count: self.retry_count,
            last_checked_at: self.last_checked_at,
            last_transition_at: self.last_transition_at,
            last_result: self.last_result.clone(),
            last_latency_ms: self.last_latency.map(|l| l.as_millis() as u64),
            blocked_by,
            failure: self.failure.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);
    const WINDOW: Duration = Duration::from_secs(60);

    fn policy(max_retries: u32) -> RestartPolicy {
        RestartPolicy::new(max_retries, Duration::from_secs(1), Duration::from_secs(8))
    }

    fn unhealthy() -> HealthResult {
        HealthResult::Unhealthy("connection refused".to_string())
    }

    fn healthy_state(now: Instant) -> ServiceState {
        let mut state = ServiceState::new();
        state.launch();
        state.observe(HealthResult::Healthy, Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        state
    }

    #[test]
    fn launch_only_from_pending() {
        let mut state = ServiceState::new();
        let t = state.launch().unwrap();
        assert_eq!(t.from, ServicePhase::Pending);
        assert_eq!(t.to, ServicePhase::Starting);
        assert_eq!(state.generation, 1);
        assert!(state.launch().is_none());
    }

    #[test]
    fn first_healthy_probe_finishes_startup() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.launch();
        let (t, d) = state.observe(HealthResult::Healthy, Duration::from_millis(3), &policy(2), WINDOW, INTERVAL, now);
        assert_eq!(t.unwrap().to, ServicePhase::Healthy);
        assert_eq!(d, Directive::Poll(INTERVAL));
        assert_eq!(state.last_latency, Some(Duration::from_millis(3)));
    }

    #[test]
    fn failures_while_starting_back_off_then_fail() {
        let now = Instant::now();
        let mut state = ServiceState::new();
        state.launch();

        let (t, d) = state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        assert!(t.is_none());
        assert_eq!(d, Directive::Poll(Duration::from_secs(1)));

        let (t, d) = state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        assert!(t.is_none());
        assert_eq!(d, Directive::Poll(Duration::from_secs(2)));

        let (t, d) = state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        assert_eq!(t.unwrap().to, ServicePhase::Failed);
        assert_eq!(d, Directive::Halt);
        assert_eq!(state.consecutive_failures, 3);
        assert!(matches!(
            state.failure,
            Some(FailureCause::RetriesExhausted { failures: 3, .. })
        ));
    }

    #[test]
    fn unhealthy_schedules_restarts_with_backoff() {
        let now = Instant::now();
        let mut state = healthy_state(now);

        let (t, d) = state.observe(HealthResult::TimedOut, Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        let t = t.unwrap();
        assert_eq!((t.from, t.to), (ServicePhase::Healthy, ServicePhase::Unhealthy));
        assert_eq!(t.reason.as_deref(), Some("timed out"));
        assert_eq!(d, Directive::Restart(Duration::from_secs(1)));
        assert_eq!(state.retry_count, 1);

        let (t, d) = state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        assert!(t.is_none());
        assert_eq!(d, Directive::Restart(Duration::from_secs(2)));
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.consecutive_failures, 2);
    }

    #[test]
    fn failed_is_terminal_under_more_failures() {
        let now = Instant::now();
        let mut state = healthy_state(now);
        for _ in 0..3 {
            state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        }
        assert_eq!(state.phase, ServicePhase::Failed);

        for _ in 0..5 {
            let (t, d) = state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
            assert!(t.is_none());
            assert_eq!(d, Directive::Halt);
        }
        assert_eq!(state.phase, ServicePhase::Failed);
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn recovery_resets_consecutive_failures_but_not_retry_count() {
        let now = Instant::now();
        let mut state = healthy_state(now);
        state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        assert_eq!(state.phase, ServicePhase::Unhealthy);

        let (t, _) = state.observe(HealthResult::Healthy, Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        assert_eq!(t.unwrap().to, ServicePhase::Healthy);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.retry_count, 1);
    }

    #[test]
    fn retry_count_resets_after_stabilization_window() {
        let start = Instant::now();
        let mut state = healthy_state(start);
        state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, start);
        state.observe(HealthResult::Healthy, Duration::ZERO, &policy(2), WINDOW, INTERVAL, start);
        assert_eq!(state.retry_count, 1);

        state.observe(HealthResult::Healthy, Duration::ZERO, &policy(2), WINDOW, INTERVAL, start + WINDOW / 2);
        assert_eq!(state.retry_count, 1);

        state.observe(HealthResult::Healthy, Duration::ZERO, &policy(2), WINDOW, INTERVAL, start + WINDOW);
        assert_eq!(state.retry_count, 0);
    }

    #[test]
    fn startup_timeout_only_applies_while_starting() {
        let mut state = ServiceState::new();
        assert!(state.startup_expired(Duration::from_secs(1)).is_none());
        state.launch();
        let t = state.startup_expired(Duration::from_secs(1)).unwrap();
        assert_eq!(t.to, ServicePhase::Failed);
        assert_eq!(
            state.failure,
            Some(FailureCause::StartupTimeout { after_ms: 1000 })
        );
    }

    #[test]
    fn reset_clears_failure_and_counters() {
        let now = Instant::now();
        let mut state = healthy_state(now);
        for _ in 0..3 {
            state.observe(unhealthy(), Duration::ZERO, &policy(2), WINDOW, INTERVAL, now);
        }
        let generation = state.generation;
        let t = state.reset().unwrap();
        assert_eq!((t.from, t.to), (ServicePhase::Failed, ServicePhase::Pending));
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.failure.is_none());
        assert!(state.generation > generation);
    }

    #[test]
    fn stop_is_reachable_from_any_phase_once() {
        let mut state = ServiceState::new();
        assert_eq!(state.stop().unwrap().to, ServicePhase::Stopped);
        assert!(state.stop().is_none());
        let (t, d) = state.observe(HealthResult::Healthy, Duration::ZERO, &policy(2), WINDOW, INTERVAL, Instant::now());
        assert!(t.is_none());
        assert_eq!(d, Directive::Halt);
    }
}
