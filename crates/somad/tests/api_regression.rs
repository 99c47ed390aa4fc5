//! End-to-end regression tests over the full router: repository setup,
//! request admission, check instance rollout and the deployment query
//! endpoints.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use soma_api::{ApiState, build_router};
use soma_lifecycle::{DeploymentEngine, EngineConfig};
use soma_state::*;
use soma_treekeeper::Supervisor;

struct App {
    store: StateStore,
    supervisor: Supervisor,
    router: Router,
}

fn app() -> App {
    let store = StateStore::open_in_memory().unwrap();
    let supervisor = Supervisor::new(store.clone(), 16);
    let router = build_router(ApiState::new(store.clone(), supervisor.clone()));
    App {
        store,
        supervisor,
        router,
    }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn submit(router: &Router, repository: &str, action: &str, payload: Value) -> (StatusCode, Value) {
    call(
        router,
        "POST",
        "/requests?wait=true",
        Some(json!({
            "action": action,
            "repository": repository,
            "user": "alice",
            "team": "ops",
            "payload": payload,
        })),
    )
    .await
}

/// Repository `r1` with bucket `b1`, group `g1` holding node `n1`
/// (asset 4711) and a monitoring system `mon` with capability `cap`.
async fn inventory(app: &App) {
    let (status, _) = call(
        &app.router,
        "POST",
        "/repositories",
        Some(json!({"id": "r1", "name": "alpha", "team_id": "ops"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    app.supervisor.handle("r1").await.unwrap().wait_ready().await;

    let (status, _) = call(
        &app.router,
        "POST",
        "/monitoring-systems",
        Some(json!({"id": "mon", "name": "icinga", "mode": "private", "contact": "ops@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = call(
        &app.router,
        "POST",
        "/capabilities",
        Some(json!({"id": "cap", "monitoring_id": "mon", "metric": "cpu.usage", "view": "local"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    for (action, payload) in [
        ("create_bucket", json!({"id": "b1", "name": "prod", "environment": "live"})),
        ("create_group", json!({"id": "g1", "name": "web", "bucket_id": "b1"})),
        (
            "create_node",
            json!({"id": "n1", "name": "web-01", "asset_id": 4711, "bucket_id": "b1"}),
        ),
        ("add_node_to_group", json!({"child_id": "n1", "parent_id": "g1"})),
    ] {
        let (status, body) = submit(&app.router, "r1", action, payload).await;
        assert_eq!(status, StatusCode::OK, "{action}: {body}");
    }
}

async fn attach_check(app: &App, interval: u64) -> Value {
    let (status, body) = submit(
        &app.router,
        "r1",
        "create_check_configuration",
        json!({
            "id": "cc1",
            "name": "cpu",
            "object_id": "g1",
            "object_type": "group",
            "capability_id": "cap",
            "interval": interval,
            "thresholds": [{"predicate": ">=", "level": "warning", "value": 80}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

fn node_instance(store: &StateStore) -> CheckInstance {
    store
        .list_where(|i: &CheckInstance| i.object_id == "n1" && !i.deleted)
        .unwrap()
        .pop()
        .unwrap()
}

#[tokio::test]
async fn rollout_walkthrough() {
    let app = app();
    inventory(&app).await;
    let body = attach_check(&app, 60).await;
    assert_eq!(body["data"]["recompute"]["new_versions"], 2);

    // Group and inherited node check both yield an instance.
    let (status, body) = call(&app.router, "GET", "/deployments/monitoring/mon", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    // Listing acknowledged them.
    let (_, body) = call(&app.router, "GET", "/deployments/monitoring/mon", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
    let (_, body) = call(&app.router, "GET", "/deployments/monitoring/mon/all", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let instance = node_instance(&app.store);
    let uri = format!("/deployments/id/{}", instance.id);
    let (status, body) = call(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "rollout_in_progress");
    assert_eq!(body["data"]["task"], "rollout");
    assert_eq!(body["data"]["details"]["target"]["asset_id"], 4711);

    let (status, body) = call(&app.router, "PATCH", &format!("{uri}/success"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");
    assert!(body["data"]["next_status"].is_null());
    let config_id = body["data"]["config_id"].as_str().unwrap().to_string();
    let config: CheckInstanceConfiguration = app.store.require(&config_id).unwrap();
    assert!(config.activated_at.is_some());

    // A second success has nothing to act on.
    let (status, body) = call(&app.router, "PATCH", &format!("{uri}/success"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, _) = call(&app.router, "PATCH", &format!("{uri}/maybe"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn changed_configuration_replaces_active_version() {
    let app = app();
    inventory(&app).await;
    attach_check(&app, 60).await;

    let instance = node_instance(&app.store);
    let uri = format!("/deployments/id/{}", instance.id);
    call(&app.router, "GET", &uri, None).await;
    call(&app.router, "PATCH", &format!("{uri}/success"), None).await;

    // Changing a property of the node changes its deployment details.
    let (status, _) = submit(
        &app.router,
        "r1",
        "set_property",
        json!({"object_id": "n1", "object_type": "node", "key": "dc", "value": "fra1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let versions = app.store.configs_for_instance(&instance.id).unwrap();
    assert_eq!(versions.len(), 2);
    let old = versions.iter().find(|c| c.version == 0).unwrap();
    let new = versions.iter().find(|c| c.version == 1).unwrap();
    assert_eq!(old.status, DeploymentStatus::AwaitingDeprovision);
    assert_eq!(new.status, DeploymentStatus::Blocked);
    let edges = app
        .store
        .list::<CheckInstanceConfigurationDependency>()
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].blocking_instance_config_id, old.id);
    assert_eq!(edges[0].unblocking_state, DeploymentStatus::Deprovisioned);

    // The monitoring system tears the old version down.
    let (_, body) = call(&app.router, "GET", &uri, None).await;
    assert_eq!(body["data"]["task"], "deprovision");
    assert_eq!(body["data"]["status"], "deprovision_in_progress");
    let (status, body) = call(&app.router, "PATCH", &format!("{uri}/success"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "deprovisioned");

    let engine = DeploymentEngine::new(app.store.clone(), EngineConfig::default());
    let report = engine.run_cycle().await;
    assert_eq!(report.unblocked, 1);
    assert!(
        app.store
            .list::<CheckInstanceConfigurationDependency>()
            .unwrap()
            .is_empty()
    );

    let (_, body) = call(&app.router, "GET", &uri, None).await;
    assert_eq!(body["data"]["version"], 1);
    assert_eq!(body["data"]["status"], "rollout_in_progress");
    assert_eq!(body["data"]["details"]["target"]["properties"]["dc"], "fra1");

    // Re-running the cycle changes nothing further.
    assert_eq!(engine.run_cycle().await.unblocked, 0);
}

#[tokio::test]
async fn identical_recompute_creates_no_version() {
    let app = app();
    inventory(&app).await;
    attach_check(&app, 60).await;
    let instance = node_instance(&app.store);

    // A job that does not touch the node's details.
    let (status, body) = submit(
        &app.router,
        "r1",
        "create_bucket",
        json!({"id": "b2", "name": "staging", "environment": "qa"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["recompute"]["new_versions"], 0);
    assert_eq!(app.store.configs_for_instance(&instance.id).unwrap().len(), 1);
}

#[tokio::test]
async fn host_bundle_and_assembly() {
    let app = app();
    inventory(&app).await;
    attach_check(&app, 60).await;
    let instance = node_instance(&app.store);

    let (status, body) = call(&app.router, "GET", "/deployments/host/icinga/4711", None).await;
    assert_eq!(status, StatusCode::OK);
    let deployments = body["data"]["deployments"].as_array().unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0]["check_instance_id"], instance.id.as_str());

    let (status, body) = call(
        &app.router,
        "POST",
        "/deployments/host/mon/4711",
        Some(json!({"known": [instance.id.clone(), "stale-instance"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["delete"], json!(["stale-instance"]));

    let (status, _) = call(&app.router, "GET", "/deployments/host/icinga/9999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app.router, "GET", "/deployments/host/icinga/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app.router, "GET", "/deployments/host/nagios/4711", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admission_rejections_leave_no_jobs() {
    let app = app();
    inventory(&app).await;
    let before = app.store.list::<Job>().unwrap().len();

    let (status, body) = submit(&app.router, "unknown", "create_bucket", json!({"name": "x", "environment": "e"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = submit(&app.router, "r1", "launch_rocket", json!({})).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

    let (status, _) = submit(&app.router, "r1", "create_group", json!({"name": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(app.store.list::<Job>().unwrap().len(), before);
}

#[tokio::test]
async fn accepted_request_is_tracked_in_job_ledger() {
    let app = app();
    inventory(&app).await;

    let (status, body) = call(
        &app.router,
        "POST",
        "/requests",
        Some(json!({
            "action": "create_cluster",
            "bucket_id": "b1",
            "payload": {"id": "c1", "name": "db", "bucket_id": "b1"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["repository_id"], "r1");

    // Jobs run in order: a waited request submitted afterwards finishes later.
    submit(&app.router, "r1", "create_node", json!({"name": "db-01", "asset_id": 1, "bucket_id": "b1"})).await;

    let (status, body) = call(&app.router, "GET", &format!("/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "processed");
    assert_eq!(body["data"]["result"], "success");
    assert_eq!(body["data"]["job_type"], "create_cluster");

    let (status, _) = call(&app.router, "GET", "/jobs/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_job_reports_error_with_job_id() {
    let app = app();
    inventory(&app).await;

    let (status, body) = submit(
        &app.router,
        "r1",
        "add_node_to_group",
        json!({"child_id": "n1", "parent_id": "missing"}),
    )
    .await;
    assert!(status.is_client_error(), "{status}: {body}");
    let job_id = body["job_id"].as_str().unwrap();
    let job: Job = app.store.require(job_id).unwrap();
    assert_eq!(job.result, JobResult::Failed);
    assert!(job.error.is_some());
}

#[tokio::test]
async fn broken_repository_is_frozen() {
    let app = app();
    app.store
        .put(&Repository {
            id: "r9".into(),
            name: "tangled".into(),
            team_id: "ops".into(),
            created_at: 1,
        })
        .unwrap();
    app.store
        .put(&Bucket {
            id: "b9".into(),
            name: "b".into(),
            repository_id: "r9".into(),
            environment: "live".into(),
            created_at: 1,
        })
        .unwrap();
    for (child, parent) in [("ga", "gb"), ("gb", "ga")] {
        app.store
            .put(&Group {
                id: child.into(),
                name: child.into(),
                bucket_id: "b9".into(),
                state: ObjectState::Grouped,
                properties: Default::default(),
            })
            .unwrap();
        app.store
            .put(&Membership {
                child_id: child.into(),
                child_type: ObjectType::Group,
                parent_id: parent.into(),
                parent_type: ObjectType::Group,
            })
            .unwrap();
    }
    app.supervisor.register("r9").await.wait_ready().await;

    let (status, body) = call(&app.router, "GET", "/repositories/r9/keeper", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ready"], true);
    assert_eq!(body["data"]["broken"], true);

    for _ in 0..2 {
        let (status, _) = submit(&app.router, "r9", "create_group", json!({"name": "x", "bucket_id": "b9"})).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert!(app.store.list::<Job>().unwrap().is_empty());
}

#[tokio::test]
async fn repository_conflicts_and_keeper_lookup() {
    let app = app();
    inventory(&app).await;

    let (status, _) = call(&app.router, "POST", "/repositories", Some(json!({"name": "alpha"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = call(&app.router, "POST", "/repositories", Some(json!({"name": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app.router, "GET", "/repositories/r1/keeper", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ready"], true);
    assert_eq!(body["data"]["broken"], false);
    assert!(body["data"]["jobs_processed"].as_u64().unwrap() >= 4);

    let (status, _) = call(&app.router, "GET", "/repositories/nope/keeper", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app.router, "GET", "/repositories", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = call(
        &app.router,
        "POST",
        "/capabilities",
        Some(json!({"monitoring_id": "ghost", "metric": "m"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_repository_creation_keeps_names_unique() {
    let app = app();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let router = app.router.clone();
        tasks.push(tokio::spawn(async move {
            call(
                &router,
                "POST",
                "/repositories",
                Some(json!({"id": format!("race-{i}"), "name": "shared", "team_id": "ops"})),
            )
            .await
            .0
        }));
    }
    let mut created = 0;
    for task in tasks {
        match task.await.unwrap() {
            StatusCode::CREATED => created += 1,
            status => assert_eq!(status, StatusCode::CONFLICT),
        }
    }

    assert_eq!(created, 1);
    let stored = app
        .store
        .list_where(|r: &Repository| r.name == "shared")
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(app.supervisor.repositories().await, vec![stored[0].id.clone()]);
}
