//! Supervisor errors

use crate::types::ServiceName;
use thiserror::Error;

/// Errors returned by supervisor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// Supervisor is shutting down or has stopped
    #[error("supervisor {0} is shutting down")]
    ShuttingDown(String),
    /// No service with this name is registered
    #[error("service {0} not found")]
    ServiceNotFound(ServiceName),
    /// An internal invariant was violated and the supervisor halted
    #[error("supervisor {supervisor} halted: {reason}")]
    Fatal {
        /// Supervisor name
        supervisor: String,
        /// Violated invariant
        reason: String,
    },
}
