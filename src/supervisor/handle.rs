//! Supervisor handle - public API for interacting with supervisors

use super::error::SupervisorError;
use super::runtime::{SupervisorCommand, SupervisorRuntime};
use super::spec::SupervisorSpec;
use crate::lifecycle::ServiceControl;
use crate::probe::HealthProbe;
use crate::status::{AggregatedStatus, StatusReporter};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Handle used to interact with a running supervisor.
///
/// Clones share the same supervisor. When the last clone is dropped the
/// supervisor shuts down as if [`SupervisorHandle::shutdown`] had been called.
#[derive(Clone)]
pub struct SupervisorHandle {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    control_tx: mpsc::UnboundedSender<SupervisorCommand>,
    reporter: StatusReporter,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let (respond_to, _) = oneshot::channel();
        let _ = self
            .control_tx
            .send(SupervisorCommand::Shutdown { respond_to });
    }
}

impl SupervisorHandle {
    /// Spawns a supervisor. Services are launched in dependency order as soon
    /// as the runtime starts.
    pub fn start<P, C>(spec: SupervisorSpec, probe: P, control: C) -> Self
    where
        P: HealthProbe,
        C: ServiceControl,
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let name = spec.name.clone();
        let (runtime, reporter) = SupervisorRuntime::new(
            spec,
            Arc::new(probe),
            Arc::new(control),
            control_rx,
            control_tx.clone(),
        );

        let runtime_name = name.clone();
        tokio::spawn(async move {
            runtime.run().await;
            slog::info!(slog_scope::logger(), "supervisor stopped";
                "supervisor" => &runtime_name
            );
        });

        Self {
            inner: Arc::new(Inner {
                name,
                control_tx,
                reporter,
            }),
        }
    }

    /// Read-only status access that can be handed to other tasks.
    pub fn reporter(&self) -> StatusReporter {
        self.inner.reporter.clone()
    }

    /// Current aggregated status.
    pub fn status(&self) -> AggregatedStatus {
        self.inner.reporter.snapshot()
    }

    /// Operator restart: clears the service's counters (and a failed state)
    /// and relaunches it once its dependencies are healthy.
    pub async fn restart_service(&self, name: &str) -> Result<(), SupervisorError> {
        let (result_tx, result_rx) = oneshot::channel();

        self.inner
            .control_tx
            .send(SupervisorCommand::RestartService {
                service: name.to_string(),
                respond_to: result_tx,
            })
            .map_err(|_| SupervisorError::ShuttingDown(self.name().to_string()))?;

        result_rx
            .await
            .map_err(|_| SupervisorError::ShuttingDown(self.name().to_string()))?
    }

    /// Stops polling, lets in-flight probes finish within the grace period,
    /// stops every launched service in reverse dependency order and waits
    /// until all of that is done.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (done_tx, done_rx) = oneshot::channel();

        self.inner
            .control_tx
            .send(SupervisorCommand::Shutdown {
                respond_to: done_tx,
            })
            .map_err(|_| SupervisorError::ShuttingDown(self.name().to_string()))?;

        done_rx
            .await
            .map_err(|_| SupervisorError::ShuttingDown(self.name().to_string()))
    }

    /// Resolves once the supervisor has stopped, whether by shutdown or halt.
    pub async fn closed(&self) {
        self.inner.control_tx.closed().await;
    }

    /// Returns the supervisor's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}
