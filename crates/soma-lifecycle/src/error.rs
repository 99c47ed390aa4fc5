//! Lifecycle error types.

use std::time::Duration;

use soma_state::{DeploymentStatus, StateError};
use thiserror::Error;

/// Errors raised by lifecycle computation and the deployment query operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal state transition: {event} while {from}")]
    IllegalStateTransition {
        from: DeploymentStatus,
        event: String,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors raised while delivering an outbound notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("unsupported scheme in {0}")]
    UnsupportedScheme(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
