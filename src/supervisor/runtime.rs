//! Supervisor runtime - owns every service's state

use super::error::SupervisorError;
use super::spec::{CascadePolicy, SupervisorSpec};
use super::state::{Directive, ServiceState, Transition};
use super::task::{Launch, ProbeReport, ServiceTask, StartupDeadline};
use crate::lifecycle::ServiceControl;
use crate::probe::HealthProbe;
use crate::registry::Registry;
use crate::service::ServiceSpec;
use crate::status::{Published, StatusReporter, TRANSITION_HISTORY};
use crate::types::{ServiceName, ServicePhase, TransitionEvent};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Internal commands sent to the supervisor runtime
pub(crate) enum SupervisorCommand {
    ProbeReport(ProbeReport),
    StartupDeadline(StartupDeadline),
    RestartService {
        service: ServiceName,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

impl From<ProbeReport> for SupervisorCommand {
    fn from(report: ProbeReport) -> Self {
        SupervisorCommand::ProbeReport(report)
    }
}

impl From<StartupDeadline> for SupervisorCommand {
    fn from(deadline: StartupDeadline) -> Self {
        SupervisorCommand::StartupDeadline(deadline)
    }
}

/// Single writer of every [`ServiceState`]. Commands are handled one at a
/// time, so transitions of one service are totally ordered and dependency
/// checks always see committed state.
pub(crate) struct SupervisorRuntime<P, C> {
    spec: SupervisorSpec,
    registry: Arc<Registry>,
    states: Vec<ServiceState>,
    tasks: Vec<Option<ServiceTask>>,
    launch_mode: Vec<Launch>,
    retired: Vec<ServiceTask>,
    background: Vec<JoinHandle<()>>,
    probe: Arc<P>,
    control: Arc<C>,
    control_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    control_tx: mpsc::UnboundedSender<SupervisorCommand>,
    snapshot_tx: watch::Sender<Published>,
    transitions: VecDeque<TransitionEvent>,
    next_seq: u64,
    halted: Option<String>,
    stopped: bool,
}

impl<P: HealthProbe, C: ServiceControl> SupervisorRuntime<P, C> {
    pub(crate) fn new(
        spec: SupervisorSpec,
        probe: Arc<P>,
        control: Arc<C>,
        control_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
        control_tx: mpsc::UnboundedSender<SupervisorCommand>,
    ) -> (Self, StatusReporter) {
        let registry = Arc::clone(&spec.registry);
        let count = registry.len();
        let (snapshot_tx, snapshot_rx) = watch::channel(Published {
            supervisor: spec.name.clone(),
            services: Vec::new(),
            transitions: VecDeque::new(),
            halted: None,
            stopped: false,
        });

        let runtime = Self {
            spec,
            registry,
            states: (0..count).map(|_| ServiceState::new()).collect(),
            tasks: (0..count).map(|_| None).collect(),
            launch_mode: vec![Launch::Start; count],
            retired: Vec::new(),
            background: Vec::new(),
            probe,
            control,
            control_rx,
            control_tx,
            snapshot_tx,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            next_seq: 0,
            halted: None,
            stopped: false,
        };
        runtime.publish();

        (runtime, StatusReporter::new(snapshot_rx))
    }

    pub(crate) async fn run(mut self) {
        slog::info!(slog_scope::logger(), "supervisor started";
            "supervisor" => &self.spec.name,
            "services" => self.registry.len()
        );

        self.start_ready();
        self.publish();

        while let Some(command) = self.control_rx.recv().await {
            self.prune();
            let outcome = match command {
                SupervisorCommand::ProbeReport(report) => self.handle_probe_report(report),
                SupervisorCommand::StartupDeadline(deadline) => {
                    self.handle_startup_deadline(deadline)
                }
                SupervisorCommand::RestartService {
                    service,
                    respond_to,
                } => {
                    let result = self.handle_restart_service(&service);
                    let _ = respond_to.send(result);
                    Ok(())
                }
                SupervisorCommand::Shutdown { respond_to } => {
                    self.shutdown().await;
                    self.publish();
                    let _ = respond_to.send(());
                    return;
                }
            };

            if let Err(err) = outcome {
                self.halt(err).await;
                return;
            }
            self.publish();
        }
    }

    fn handle_probe_report(&mut self, report: ProbeReport) -> Result<(), SupervisorError> {
        let ProbeReport {
            service,
            generation,
            result,
            latency,
            respond_to,
        } = report;

        let position = self.position(&service)?;
        if self.states[position].generation != generation {
            let _ = respond_to.send(Directive::Halt);
            return Ok(());
        }

        let spec = Arc::clone(self.registry.spec_at(position));
        let interval = self.spec.poll_interval_for(&spec);
        let (transition, directive) = self.states[position].observe(
            result,
            latency,
            &spec.restart_policy,
            self.spec.stabilization_window,
            interval,
            Instant::now(),
        );
        let _ = respond_to.send(directive);

        if let Some(transition) = transition {
            self.commit(position, transition);
        }
        Ok(())
    }

    fn handle_startup_deadline(&mut self, deadline: StartupDeadline) -> Result<(), SupervisorError> {
        let position = self.position(&deadline.service)?;
        if self.states[position].generation != deadline.generation {
            return Ok(());
        }

        let timeout = self.registry.spec_at(position).startup_timeout;
        if let Some(transition) = self.states[position].startup_expired(timeout) {
            self.commit(position, transition);
        }
        Ok(())
    }

    fn handle_restart_service(&mut self, service: &str) -> Result<(), SupervisorError> {
        let position = self
            .registry
            .position(service)
            .ok_or_else(|| SupervisorError::ServiceNotFound(service.to_string()))?;

        slog::info!(slog_scope::logger(), "operator restart";
            "supervisor" => &self.spec.name,
            "service" => service
        );

        self.retire(position);
        let was_launched = self.states[position].phase.is_launched();
        if let Some(transition) = self.states[position].reset() {
            self.commit(position, transition);
        }
        self.launch_mode[position] = if was_launched {
            Launch::Restart
        } else {
            Launch::Start
        };
        self.start_ready();
        Ok(())
    }

    /// Launches every pending service whose dependencies are all healthy.
    fn start_ready(&mut self) {
        let order: Vec<usize> = self.registry.graph().order_indices().collect();
        for position in order {
            if self.states[position].phase != ServicePhase::Pending {
                continue;
            }
            let ready = self
                .registry
                .graph()
                .dependency_indices(position)
                .iter()
                .all(|&dep| self.states[dep].phase == ServicePhase::Healthy);
            if ready {
                self.launch(position);
            }
        }
    }

    fn launch(&mut self, position: usize) {
        let Some(transition) = self.states[position].launch() else {
            return;
        };
        self.retire(position);

        let mode = std::mem::replace(&mut self.launch_mode[position], Launch::Start);
        let task = ServiceTask::spawn(
            &self.spec.name,
            Arc::clone(self.registry.spec_at(position)),
            self.states[position].generation,
            mode,
            Arc::clone(&self.probe),
            Arc::clone(&self.control),
            self.control_tx.clone(),
        );
        self.tasks[position] = Some(task);
        self.commit(position, transition);
    }

    /// Cancels the current task of a service and keeps it until it winds down.
    fn retire(&mut self, position: usize) {
        if let Some(mut task) = self.tasks[position].take() {
            task.cancel();
            self.retired.push(task);
        }
    }

    fn commit(&mut self, position: usize, transition: Transition) {
        let name = self.registry.spec_at(position).name.clone();
        log_transition(&self.spec.name, &name, &transition);

        let event = TransitionEvent {
            seq: self.next_seq,
            service: name,
            from: transition.from,
            to: transition.to,
            at: Utc::now(),
            reason: transition.reason,
        };
        self.next_seq += 1;
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(event);

        match transition.to {
            ServicePhase::Healthy => {
                if let Some(task) = self.tasks[position].as_mut() {
                    task.disarm_deadline();
                }
                self.start_ready();
            }
            ServicePhase::Failed => {
                self.retire(position);
                if self.spec.cascade == CascadePolicy::Stop {
                    self.cascade_stop(position);
                }
            }
            _ => {}
        }
    }

    /// Stops every running dependent of a failed service and holds it in
    /// `Pending` until the service is healthy again.
    fn cascade_stop(&mut self, failed: usize) {
        let failed_name = self.registry.spec_at(failed).name.clone();
        for dependent in self.registry.graph().transitive_dependent_indices(failed) {
            let Some(transition) = self.states[dependent].hold(format!("dependency {} failed", failed_name))
            else {
                continue;
            };
            self.retire(dependent);
            self.launch_mode[dependent] = Launch::Start;

            let spec = Arc::clone(self.registry.spec_at(dependent));
            let control = Arc::clone(&self.control);
            self.background.push(tokio::spawn(async move {
                stop_service(control.as_ref(), &spec).await;
            }));
            self.commit(dependent, transition);
        }
    }

    /// Waits for every background task until the grace period ends, then
    /// aborts whatever is left.
    async fn drain_tasks(&mut self) {
        let deadline = Instant::now() + self.spec.shutdown_grace_period;

        let mut tasks: Vec<ServiceTask> = self.tasks.iter_mut().filter_map(Option::take).collect();
        tasks.append(&mut self.retired);
        for task in &mut tasks {
            task.cancel();
        }
        for task in tasks {
            let generation = task.generation;
            if !task.join(deadline).await {
                slog::warn!(slog_scope::logger(), "service task aborted after grace period";
                    "supervisor" => &self.spec.name,
                    "generation" => generation
                );
            }
        }

        for mut handle in self.background.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    async fn shutdown(&mut self) {
        slog::info!(slog_scope::logger(), "supervisor shutting down";
            "supervisor" => &self.spec.name
        );

        self.drain_tasks().await;

        let order: Vec<usize> = self.registry.graph().order_indices().rev().collect();
        for position in order {
            if self.states[position].phase.is_launched() {
                let spec = Arc::clone(self.registry.spec_at(position));
                stop_service(self.control.as_ref(), &spec).await;
            }
            if let Some(transition) = self.states[position].stop() {
                self.commit(position, transition);
            }
        }
        self.stopped = true;
    }

    /// Stops all background work and leaves services untouched. Only used when
    /// the runtime can no longer trust its own state.
    async fn halt(&mut self, err: SupervisorError) {
        slog::crit!(slog_scope::logger(), "supervisor halted";
            "supervisor" => &self.spec.name,
            "error" => %err
        );
        self.halted = Some(err.to_string());
        self.drain_tasks().await;
        self.publish();
    }

    fn prune(&mut self) {
        self.retired.retain(|task| !task.is_finished());
        self.background.retain(|handle| !handle.is_finished());
    }

    fn position(&self, service: &str) -> Result<usize, SupervisorError> {
        self.registry
            .position(service)
            .ok_or_else(|| SupervisorError::Fatal {
                supervisor: self.spec.name.clone(),
                reason: format!("state transition requested for unknown service {}", service),
            })
    }

    fn publish(&self) {
        let graph = self.registry.graph();
        let services = self
            .registry
            .iter()
            .enumerate()
            .map(|(position, spec)| {
                let state = &self.states[position];
                let blocked_by = if state.phase == ServicePhase::Pending {
                    graph
                        .dependency_indices(position)
                        .iter()
                        .filter(|&&dep| self.states[dep].phase != ServicePhase::Healthy)
                        .map(|&dep| self.registry.spec_at(dep).name.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                state.snapshot(&spec.name, blocked_by)
            })
            .collect();

        self.snapshot_tx.send_replace(Published {
            supervisor: self.spec.name.clone(),
            services,
            transitions: self.transitions.clone(),
            halted: self.halted.clone(),
            stopped: self.stopped,
        });
    }
}

async fn stop_service<C: ServiceControl + ?Sized>(control: &C, spec: &ServiceSpec) {
    if let Err(err) = control.stop(spec).await {
        slog::warn!(slog_scope::logger(), "stop failed, killing";
            "service" => &spec.name,
            "error" => %err
        );
        if let Err(err) = control.kill(spec).await {
            slog::error!(slog_scope::logger(), "kill failed";
                "service" => &spec.name,
                "error" => %err
            );
        }
    }
}

fn log_transition(supervisor: &str, service: &str, transition: &Transition) {
    let logger = slog_scope::logger();
    let reason = transition.reason.as_deref().unwrap_or("");
    match transition.to {
        ServicePhase::Unhealthy => slog::warn!(logger, "service transition";
            "supervisor" => supervisor,
            "service" => service,
            "from" => %transition.from,
            "to" => %transition.to,
            "reason" => reason
        ),
        ServicePhase::Failed => slog::error!(logger, "service transition";
            "supervisor" => supervisor,
            "service" => service,
            "from" => %transition.from,
            "to" => %transition.to,
            "reason" => reason
        ),
        _ => slog::info!(logger, "service transition";
            "supervisor" => supervisor,
            "service" => service,
            "from" => %transition.from,
            "to" => %transition.to,
            "reason" => reason
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Detached;
    use crate::probe::HealthResult;
    use crate::service::{HealthCheck, ServiceSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn check(&self, _spec: &ServiceSpec) -> HealthResult {
            HealthResult::Healthy
        }
    }

    #[tokio::test(start_paused = true)]
    async fn report_for_unknown_service_halts_runtime() {
        let registry = Registry::load([ServiceSpec::new("db", HealthCheck::tcp("127.0.0.1", 1))])
            .unwrap();
        let spec = SupervisorSpec::new("halting", registry);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (runtime, mut reporter) = SupervisorRuntime::new(
            spec,
            Arc::new(AlwaysHealthy),
            Arc::new(Detached),
            control_rx,
            control_tx.clone(),
        );
        let running = tokio::spawn(runtime.run());

        let (respond_to, _directive) = oneshot::channel();
        control_tx
            .send(SupervisorCommand::ProbeReport(ProbeReport {
                service: "ghost".to_string(),
                generation: 1,
                result: HealthResult::Healthy,
                latency: Duration::ZERO,
                respond_to,
            }))
            .unwrap();

        running.await.unwrap();
        let status = reporter.wait_for(|s| s.halted.is_some()).await;
        assert!(status.halted.unwrap().contains("ghost"));
        assert_eq!(status.verdict, crate::status::Verdict::Critical);
        assert!(control_tx.is_closed());
    }
}
