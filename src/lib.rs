//! Service orchestration and health supervision.
//!
//! A [`Registry`] holds the declared services and the dependency graph
//! between them. A supervisor started through [`SupervisorHandle::start`]
//! launches services in dependency order, polls each one with a
//! [`HealthProbe`], restarts unhealthy services with exponential backoff
//! and publishes an [`AggregatedStatus`] after every change.

mod graph;
mod lifecycle;
mod probe;
mod process;
mod registry;
mod restart;
mod service;
mod status;
mod supervisor;
mod types;

pub mod config;
pub mod logging;

// Re-export public API
pub use graph::DependencyGraph;
pub use lifecycle::{CommandControl, ControlError, Detached, ServiceControl};
pub use probe::{HealthProbe, HealthResult, ProbeError, SystemProbe};
pub use registry::{Registry, ValidationError};
pub use restart::RestartPolicy;
pub use service::{HealthCheck, HealthCheckKind, Lifecycle, ServiceSpec};
pub use status::{AggregatedStatus, StatusReporter, Verdict, sweep};
pub use supervisor::{CascadePolicy, SupervisorError, SupervisorHandle, SupervisorSpec};
pub use types::{FailureCause, ServiceName, ServicePhase, ServiceSnapshot, TransitionEvent};
