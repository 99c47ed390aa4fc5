//! Guide post error types.

use soma_treekeeper::KeeperError;
use thiserror::Error;

/// Reasons a request is refused at admission.
#[derive(Debug, Error)]
pub enum GuidePostError {
    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("tree keeper for repository {0} is still loading")]
    ServiceUnavailable(String),

    #[error("repository {0} is broken")]
    RepositoryBroken(String),

    #[error("action not implemented: {0}")]
    NotImplemented(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request error: {0}")]
    RequestError(String),
}

pub type GuidePostResult<T> = Result<T, GuidePostError>;

impl From<KeeperError> for GuidePostError {
    fn from(err: KeeperError) -> Self {
        match err {
            KeeperError::NotImplemented(action) => GuidePostError::NotImplemented(action),
            KeeperError::InvalidRequest(msg) => GuidePostError::InvalidRequest(msg),
            KeeperError::NotFound(what) => GuidePostError::NotFound(what),
            KeeperError::RepositoryBroken(id) => GuidePostError::RepositoryBroken(id),
            other => GuidePostError::RequestError(other.to_string()),
        }
    }
}

impl From<soma_state::StateError> for GuidePostError {
    fn from(err: soma_state::StateError) -> Self {
        GuidePostError::RequestError(err.to_string())
    }
}
