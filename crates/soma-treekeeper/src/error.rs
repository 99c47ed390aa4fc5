//! Tree keeper error types.

use soma_lifecycle::LifecycleError;
use soma_state::StateError;
use thiserror::Error;

/// Errors raised while loading a repository or executing its jobs.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("action not implemented: {0}")]
    NotImplemented(String),

    #[error("group ordering failed: {0}")]
    OrderingFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("repository broken: {0}")]
    RepositoryBroken(String),

    #[error("tree keeper mailbox closed for repository {0}")]
    MailboxClosed(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

pub type KeeperResult<T> = Result<T, KeeperError>;
