//! soma-lifecycle: deployment lifecycle for check instance configurations.
//!
//! - [`compute`] turns a freshly built deployment-detail document into a new
//!   configuration version (dedupe, supersede, or block on the predecessor).
//! - [`engine`] runs the periodic unblock / retire / poke cycle.
//! - [`deployment`] serves the pull, feedback, list and host bundle
//!   operations monitoring systems call.
//! - [`notify`] sends outbound pokes and feedback relays.

pub mod compute;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod notify;

pub use compute::{ComputeOutcome, compute_configuration, compute_in, retire_instance};
pub use deployment::{
    DeploymentView, HostBundle, assemble_host_bundle, feedback, host_bundle, list_instances, pull,
};
pub use engine::{CycleReport, DeploymentEngine, EngineConfig};
pub use error::{LifecycleError, LifecycleResult, NotifyError};
