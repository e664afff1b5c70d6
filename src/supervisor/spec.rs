//! Supervisor specification and builder

use crate::registry::Registry;
use crate::service::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// What happens to running dependents when a service fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Dependents keep running; the failure only shows in the status verdict
    #[default]
    Keep,
    /// Running dependents are stopped and held in `Pending` until the
    /// failed service is healthy again
    Stop,
}

/// Describes a supervisor and the services it manages.
#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    pub(crate) name: String,
    pub(crate) registry: Arc<Registry>,
    pub(crate) poll_interval: Duration,
    pub(crate) shutdown_grace_period: Duration,
    pub(crate) stabilization_window: Duration,
    pub(crate) cascade: CascadePolicy,
}

impl SupervisorSpec {
    /// Default interval between health checks
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Default time in-flight probes get to finish on shutdown
    pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);
    /// Default healthy time before the retry counter resets
    pub const DEFAULT_STABILIZATION_WINDOW: Duration = Duration::from_secs(60);
    /// Margin added to a check's timeout to get the shortest poll interval
    pub const POLL_MARGIN: Duration = Duration::from_millis(500);

    /// Creates a new supervisor specification for the given registry.
    pub fn new(name: impl Into<String>, registry: Registry) -> Self {
        Self {
            name: name.into(),
            registry: Arc::new(registry),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            shutdown_grace_period: Self::DEFAULT_SHUTDOWN_GRACE_PERIOD,
            stabilization_window: Self::DEFAULT_STABILIZATION_WINDOW,
            cascade: CascadePolicy::default(),
        }
    }

    /// Sets the default poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long in-flight probes may run after shutdown is requested.
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    /// Sets how long a service must stay healthy before its retry count resets.
    pub fn with_stabilization_window(mut self, window: Duration) -> Self {
        self.stabilization_window = window;
        self
    }

    /// Sets the cascading failure policy.
    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    /// Supervisor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Managed services.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Interval between checks of `service`: its own override or the default,
    /// never shorter than its check timeout plus [`Self::POLL_MARGIN`].
    pub fn poll_interval_for(&self, service: &ServiceSpec) -> Duration {
        service
            .poll_interval
            .unwrap_or(self.poll_interval)
            .max(service.health_check.timeout + Self::POLL_MARGIN)
    }
}
