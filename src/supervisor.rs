//! Supervisor types and implementation

mod error;
mod handle;
mod runtime;
mod spec;
mod state;
mod task;

pub use error::SupervisorError;
pub use handle::SupervisorHandle;
pub use spec::{CascadePolicy, SupervisorSpec};
