//! Outbound notifications to monitoring systems and to Soma itself.
//!
//! Pokes are advisory: delivery is best effort with no ordering or
//! delivery guarantee, and the caller only learns whether a response came
//! back before the timeout. The pull/feedback protocol stays authoritative.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use tracing::debug;

use soma_state::FeedbackResult;

use crate::error::NotifyError;

/// Path monitoring systems pull deployment details from.
pub const DEPLOYMENT_PATH: &str = "/deployments/id/";

/// Body of a poke notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokeNotification {
    pub uuid: String,
    pub path: String,
}

impl PokeNotification {
    pub fn new(instance_id: &str) -> Self {
        Self {
            uuid: instance_id.to_string(),
            path: DEPLOYMENT_PATH.to_string(),
        }
    }
}

/// Tell a monitoring system that work is waiting for `instance_id`.
pub async fn poke(
    callback: &str,
    instance_id: &str,
    timeout: Duration,
) -> Result<StatusCode, NotifyError> {
    let notification = PokeNotification::new(instance_id);
    send_json(Method::POST, callback, Some(&notification), timeout).await
}

/// Relay a rollout/deprovision result to Soma on behalf of a monitoring system.
pub async fn relay_feedback(
    soma_url: &str,
    instance_id: &str,
    result: FeedbackResult,
    timeout: Duration,
) -> Result<StatusCode, NotifyError> {
    let uri = format!(
        "{}{DEPLOYMENT_PATH}{instance_id}/{result}",
        soma_url.trim_end_matches('/')
    );
    send_json::<()>(Method::PATCH, &uri, None, timeout).await
}

/// Send a JSON request over a fresh HTTP/1 connection.
///
/// Returns the response status; the body is ignored. Only `http://` URIs
/// are supported.
pub async fn send_json<T: Serialize>(
    method: Method,
    uri: &str,
    body: Option<&T>,
    timeout: Duration,
) -> Result<StatusCode, NotifyError> {
    let parsed: http::Uri = uri
        .parse()
        .map_err(|e| NotifyError::InvalidUri(format!("{uri}: {e}")))?;
    if parsed.scheme_str() != Some("http") {
        return Err(NotifyError::UnsupportedScheme(uri.to_string()));
    }
    let host = parsed
        .host()
        .ok_or_else(|| NotifyError::InvalidUri(format!("{uri}: missing host")))?;
    let address = format!("{host}:{}", parsed.port_u16().unwrap_or(80));
    let path = parsed
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let payload = match body {
        Some(body) => {
            serde_json::to_vec(body).map_err(|e| NotifyError::Request(e.to_string()))?
        }
        None => Vec::new(),
    };

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| NotifyError::Connect(format!("{address}: {e}")))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NotifyError::Handshake(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path.as_str())
            .header(header::HOST, address.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, "soma-lifecycle/0.1")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        debug!(status = %resp.status(), %uri, "notification delivered");
        Ok(resp.status())
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(NotifyError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::extract::{Path, State};
    use axum::routing::{patch, post};

    type Seen = Arc<Mutex<Vec<String>>>;

    async fn spawn_server(seen: Seen) -> String {
        let router = axum::Router::new()
            .route(
                "/poke",
                post(|State(seen): State<Seen>, Json(body): Json<PokeNotification>| async move {
                    seen.lock().unwrap().push(format!("{}{}", body.path, body.uuid));
                    "ok"
                }),
            )
            .route(
                "/deployments/id/{id}/{result}",
                patch(
                    |State(seen): State<Seen>, Path((id, result)): Path<(String, String)>| async move {
                        seen.lock().unwrap().push(format!("{id}:{result}"));
                        "ok"
                    },
                ),
            )
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn poke_posts_instance_and_path() {
        let seen = Seen::default();
        let base = spawn_server(seen.clone()).await;

        let status = poke(&format!("{base}/poke"), "ci-1", Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen.lock().unwrap().as_slice(), ["/deployments/id/ci-1"]);
    }

    #[tokio::test]
    async fn relay_patches_feedback_path() {
        let seen = Seen::default();
        let base = spawn_server(seen.clone()).await;

        let status = relay_feedback(
            &format!("{base}/"),
            "ci-9",
            FeedbackResult::Failed,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen.lock().unwrap().as_slice(), ["ci-9:failed"]);
    }

    #[tokio::test]
    async fn unreachable_callback_fails_fast() {
        let result = poke("http://127.0.0.1:1/poke", "ci-1", Duration::from_millis(200)).await;
        assert!(matches!(
            result,
            Err(NotifyError::Connect(_)) | Err(NotifyError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn https_callbacks_are_rejected() {
        let result = poke("https://example.invalid/poke", "ci-1", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(NotifyError::UnsupportedScheme(_))));
    }

    #[test]
    fn notification_wire_format() {
        let json = serde_json::to_value(PokeNotification::new("abc")).unwrap();
        assert_eq!(json, serde_json::json!({"uuid": "abc", "path": "/deployments/id/"}));
    }
}
