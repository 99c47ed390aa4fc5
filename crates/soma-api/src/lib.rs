//! soma-api: REST API for Soma.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/repositories` | List repositories |
//! | POST | `/repositories` | Create a repository and start its tree keeper |
//! | GET | `/repositories/{id}/keeper` | Tree keeper status and load anomalies |
//! | POST | `/requests` | Admit a tree-mutating request (`?wait=true` to await it) |
//! | GET | `/jobs/{id}` | Job ledger entry |
//! | POST | `/monitoring-systems` | Register a monitoring system |
//! | POST | `/capabilities` | Register a capability |
//! | GET | `/deployments/id/{id}` | Pull deployment details |
//! | PATCH | `/deployments/id/{id}/{success,failed}` | Deployment feedback |
//! | GET | `/deployments/monitoring/{id}` | Pending instances of a monitoring system |
//! | GET | `/deployments/monitoring/{id}/all` | All live instances of a monitoring system |
//! | GET | `/deployments/host/{system}/{asset_id}` | Host bundle |
//! | POST | `/deployments/host/{system}/{asset_id}` | Host bundle plus ids to delete |

pub mod deployment_handlers;
pub mod handlers;
pub mod response;

use axum::Router;
use axum::http::{Method, Uri};
use axum::routing::{get, post};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use soma_guidepost::GuidePost;
use soma_state::StateStore;
use soma_treekeeper::Supervisor;

use crate::response::{ApiError, panic_response};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub supervisor: Supervisor,
    pub guidepost: GuidePost,
}

impl ApiState {
    pub fn new(store: StateStore, supervisor: Supervisor) -> Self {
        let guidepost = GuidePost::new(store.clone(), supervisor.clone());
        Self {
            store,
            supervisor,
            guidepost,
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let router = Router::new()
        .route(
            "/repositories",
            get(handlers::list_repositories).post(handlers::create_repository),
        )
        .route("/repositories/{id}/keeper", get(handlers::keeper_status))
        .route("/requests", post(handlers::submit_request))
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/monitoring-systems", post(handlers::create_monitoring_system))
        .route("/capabilities", post(handlers::create_capability))
        .route("/deployments/id/{id}", get(deployment_handlers::get_deployment))
        .route(
            "/deployments/id/{id}/{result}",
            axum::routing::patch(deployment_handlers::update_deployment),
        )
        .route("/deployments/monitoring/{id}", get(deployment_handlers::list_pending))
        .route("/deployments/monitoring/{id}/all", get(deployment_handlers::list_all))
        .route(
            "/deployments/host/{system}/{asset_id}",
            get(deployment_handlers::get_host).post(deployment_handlers::assemble_host),
        )
        .fallback(not_found)
        .with_state(state);

    guarded(router)
}

/// Request tracing plus conversion of handler panics into 500 envelopes.
pub fn guarded(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {method} {}", uri.path()))
}
