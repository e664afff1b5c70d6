//! Lifecycle control for managed services
//!
//! The supervisor never runs a service itself. It asks a [`ServiceControl`]
//! implementation to start, stop or kill it and then relies on health probes
//! to observe the outcome.

use crate::process::{RunError, run_bounded};
use crate::service::ServiceSpec;
use crate::types::ServiceName;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The lifecycle command could not be run
    #[error("{action} for {service} could not run: {reason}")]
    Spawn {
        /// Service the command belongs to
        service: ServiceName,
        /// Lifecycle action
        action: &'static str,
        /// Underlying failure
        reason: String,
    },
    /// The lifecycle command exited unsuccessfully
    #[error("{action} for {service} exited with {code:?}")]
    Exit {
        /// Service the command belongs to
        service: ServiceName,
        /// Lifecycle action
        action: &'static str,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
    },
    /// The lifecycle command did not finish in time
    #[error("{action} for {service} timed out after {timeout:?}")]
    Timeout {
        /// Service the command belongs to
        service: ServiceName,
        /// Lifecycle action
        action: &'static str,
        /// Configured limit
        timeout: Duration,
    },
}

/// Start/stop handle for an external service.
#[async_trait]
pub trait ServiceControl: Send + Sync + 'static {
    /// Starts the service.
    async fn start(&self, spec: &ServiceSpec) -> Result<(), ControlError>;

    /// Stops the service gracefully.
    async fn stop(&self, spec: &ServiceSpec) -> Result<(), ControlError>;

    /// Terminates the service forcefully.
    async fn kill(&self, spec: &ServiceSpec) -> Result<(), ControlError>;

    /// Restarts the service. Defaults to `stop` followed by `start`.
    async fn restart(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.stop(spec).await?;
        self.start(spec).await
    }
}

/// Runs the lifecycle commands declared on each service.
///
/// Services without a command for an action are treated as managed
/// elsewhere and the action succeeds immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandControl;

impl CommandControl {
    async fn run(
        &self,
        spec: &ServiceSpec,
        action: &'static str,
        argv: Option<&Vec<String>>,
    ) -> Result<(), ControlError> {
        let Some(argv) = argv else {
            return Ok(());
        };

        slog::info!(slog_scope::logger(), "running lifecycle command";
            "service" => &spec.name,
            "action" => action,
            "command" => argv.join(" ")
        );

        let timeout = spec.lifecycle.timeout;
        match run_bounded(argv, timeout).await {
            Ok(Some(0)) => Ok(()),
            Ok(code) => Err(ControlError::Exit {
                service: spec.name.clone(),
                action,
                code,
            }),
            Err(RunError::Timeout { .. }) => Err(ControlError::Timeout {
                service: spec.name.clone(),
                action,
                timeout,
            }),
            Err(err) => Err(ControlError::Spawn {
                service: spec.name.clone(),
                action,
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ServiceControl for CommandControl {
    async fn start(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.run(spec, "start", spec.lifecycle.start.as_ref()).await
    }

    async fn stop(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.run(spec, "stop", spec.lifecycle.stop.as_ref()).await
    }

    async fn kill(&self, spec: &ServiceSpec) -> Result<(), ControlError> {
        self.run(spec, "kill", spec.lifecycle.kill.as_ref()).await
    }
}

/// Control for services whose lifecycle is owned entirely by something else.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

#[async_trait]
impl ServiceControl for Detached {
    async fn start(&self, _spec: &ServiceSpec) -> Result<(), ControlError> {
        Ok(())
    }

    async fn stop(&self, _spec: &ServiceSpec) -> Result<(), ControlError> {
        Ok(())
    }

    async fn kill(&self, _spec: &ServiceSpec) -> Result<(), ControlError> {
        Ok(())
    }
}
