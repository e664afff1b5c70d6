//! Per-service background task: lifecycle call, then the polling loop

use super::spec::SupervisorSpec;
use super::state::Directive;
use crate::lifecycle::ServiceControl;
use crate::probe::{HealthProbe, HealthResult};
use crate::service::ServiceSpec;
use crate::types::ServiceName;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Message sent after every probe. The runtime answers with the next step.
pub(crate) struct ProbeReport {
    pub service: ServiceName,
    pub generation: u64,
    pub result: HealthResult,
    pub latency: Duration,
    pub respond_to: oneshot::Sender<Directive>,
}

/// Message sent when the startup timeout of a launch elapses
pub(crate) struct StartupDeadline {
    pub service: ServiceName,
    pub generation: u64,
}

/// How the service is brought up when its task starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Launch {
    Start,
    Restart,
}

/// Running task for one launch of a service
pub(crate) struct ServiceTask {
    pub generation: u64,
    token: CancellationToken,
    poller: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

impl ServiceTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<P, C, Cmd>(
        supervisor_name: &str,
        spec: Arc<ServiceSpec>,
        generation: u64,
        launch: Launch,
        probe: Arc<P>,
        control: Arc<C>,
        control_tx: mpsc::UnboundedSender<Cmd>,
    ) -> Self
    where
        P: HealthProbe,
        C: ServiceControl,
        Cmd: From<ProbeReport> + From<StartupDeadline> + Send + 'static,
    {
        let token = CancellationToken::new();

        let deadline = {
            let token = token.clone();
            let control_tx = control_tx.clone();
            let service = spec.name.clone();
            let timeout = spec.startup_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        let _ = control_tx.send(StartupDeadline { service, generation }.into());
                    }
                    _ = token.cancelled() => {}
                }
            })
        };

        let qualified_name = format!("{}/{}", supervisor_name, spec.name);
        let poller = tokio::spawn(run_service(
            qualified_name,
            spec,
            generation,
            launch,
            probe,
            control,
            control_tx,
            token.clone(),
        ));

        Self {
            generation,
            token,
            poller: Some(poller),
            deadline: Some(deadline),
        }
    }

    /// Stops the startup timer once the service has become healthy.
    pub(crate) fn disarm_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    /// Signals the task to stop after its in-flight probe, if any.
    pub(crate) fn cancel(&mut self) {
        self.token.cancel();
        self.disarm_deadline();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.poller.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels the task and waits for it until `deadline`, then aborts it.
    pub(crate) async fn join(mut self, deadline: Instant) -> bool {
        self.cancel();
        let Some(mut poller) = self.poller.take() else {
            return true;
        };
        match tokio::time::timeout_at(deadline, &mut poller).await {
            Ok(_) => true,
            Err(_) => {
                poller.abort();
                let _ = poller.await;
                false
            }
        }
    }
}

impl Drop for ServiceTask {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
        if let Some(handle) = self.poller.take() {
            handle.abort();
        }
    }
}

async fn pause(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = token.cancelled() => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_service<P, C, Cmd>(
    qualified_name: String,
    spec: Arc<ServiceSpec>,
    generation: u64,
    launch: Launch,
    probe: Arc<P>,
    control: Arc<C>,
    control_tx: mpsc::UnboundedSender<Cmd>,
    token: CancellationToken,
) where
    P: HealthProbe,
    C: ServiceControl,
    Cmd: From<ProbeReport> + Send + 'static,
{
    let launched = match launch {
        Launch::Start => control.start(&spec).await,
        Launch::Restart => control.restart(&spec).await,
    };
    if let Err(err) = launched {
        slog::warn!(slog_scope::logger(), "lifecycle command failed";
            "service" => &qualified_name,
            "error" => %err
        );
    }

    slog::debug!(slog_scope::logger(), "polling started";
        "service" => &qualified_name,
        "generation" => generation
    );

    loop {
        if token.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let bound = spec.health_check.timeout + SupervisorSpec::POLL_MARGIN;
        let result = tokio::time::timeout(bound, probe.check(&spec))
            .await
            .unwrap_or(HealthResult::TimedOut);
        let latency = started.elapsed();

        if token.is_cancelled() {
            break;
        }

        let (respond_to, directive_rx) = oneshot::channel();
        let report = ProbeReport {
            service: spec.name.clone(),
            generation,
            result,
            latency,
            respond_to,
        };
        if control_tx.send(report.into()).is_err() {
            break;
        }

        let directive = tokio::select! {
            directive = directive_rx => match directive {
                Ok(directive) => directive,
                Err(_) => break,
            },
            _ = token.cancelled() => break,
        };

        match directive {
            Directive::Halt => break,
            Directive::Poll(delay) => {
                if !pause(&token, delay).await {
                    break;
                }
            }
            Directive::Restart(delay) => {
                if !pause(&token, delay).await {
                    break;
                }
                slog::info!(slog_scope::logger(), "restarting service";
                    "service" => &qualified_name,
                    "after" => ?delay
                );
                if let Err(err) = control.restart(&spec).await {
                    slog::warn!(slog_scope::logger(), "restart failed";
                        "service" => &qualified_name,
                        "error" => %err
                    );
                }
            }
        }
    }

    slog::debug!(slog_scope::logger(), "polling stopped";
        "service" => &qualified_name,
        "generation" => generation
    );
}
