//! The JSON envelope every endpoint answers with, and the mapping from
//! domain errors to HTTP status codes.

use std::any::Any;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use soma_guidepost::GuidePostError;
use soma_lifecycle::LifecycleError;
use soma_state::StateError;
use soma_treekeeper::KeeperError;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Response {
        Self::with_status(StatusCode::OK, data, None)
    }

    pub fn with_status(status: StatusCode, data: T, job_id: Option<String>) -> Response {
        (
            status,
            Json(Self {
                success: true,
                status: status.as_u16(),
                data: Some(data),
                error: None,
                job_id,
            }),
        )
            .into_response()
    }
}

/// An error on its way to becoming an envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub job_id: Option<String>,
}

pub type ApiResult = Result<Response, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            job_id: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn with_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                status: self.status.as_u16(),
                data: None,
                error: Some(self.message),
                job_id: self.job_id,
            }),
        )
            .into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        let status = match &err {
            StateError::NotFound(_) => StatusCode::NOT_FOUND,
            StateError::Constraint(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            LifecycleError::IllegalStateTransition { .. } => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            LifecycleError::State(inner) => inner.into(),
        }
    }
}

impl From<KeeperError> for ApiError {
    fn from(err: KeeperError) -> Self {
        let status = match err {
            KeeperError::State(inner) => return inner.into(),
            KeeperError::Lifecycle(inner) => return inner.into(),
            KeeperError::NotFound(_) => StatusCode::NOT_FOUND,
            KeeperError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            KeeperError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            KeeperError::MailboxClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            KeeperError::OrderingFailed(_) | KeeperError::RepositoryBroken(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<GuidePostError> for ApiError {
    fn from(err: GuidePostError) -> Self {
        let status = match &err {
            GuidePostError::UnknownRepository(_) | GuidePostError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GuidePostError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GuidePostError::RepositoryBroken(_) | GuidePostError::RequestError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GuidePostError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            GuidePostError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

/// Turn a handler panic into a 500 envelope.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(%detail, "handler panicked");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use soma_state::DeploymentStatus;

    #[test]
    fn guidepost_errors_map_to_documented_codes() {
        let cases = [
            (GuidePostError::UnknownRepository("r".into()), 404),
            (GuidePostError::NotFound("b".into()), 404),
            (GuidePostError::ServiceUnavailable("r".into()), 503),
            (GuidePostError::RepositoryBroken("r".into()), 500),
            (GuidePostError::NotImplemented("x".into()), 501),
            (GuidePostError::InvalidRequest("x".into()), 400),
            (GuidePostError::RequestError("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError::from(err).status.as_u16(), code);
        }
    }

    #[test]
    fn lifecycle_errors_map_to_documented_codes() {
        let illegal = LifecycleError::IllegalStateTransition {
            from: DeploymentStatus::Active,
            event: "success".into(),
        };
        assert_eq!(ApiError::from(illegal).status, StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(LifecycleError::NotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(LifecycleError::State(StateError::Write("disk".into()))).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn keeper_errors_unwrap_nested_causes() {
        let nested = KeeperError::Lifecycle(LifecycleError::NotFound("x".into()));
        assert_eq!(ApiError::from(nested).status, StatusCode::NOT_FOUND);
        let nested = KeeperError::State(StateError::Constraint("dup".into()));
        assert_eq!(ApiError::from(nested).status, StatusCode::CONFLICT);
        let invalid = KeeperError::InvalidRequest("bad".into());
        assert_eq!(ApiError::from(invalid).status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn panic_payloads_become_500() {
        let resp = panic_response(Box::new("boom"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = panic_response(Box::new(42_u8));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
