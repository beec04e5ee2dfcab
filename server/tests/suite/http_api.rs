use axum::Router;
use axum::body::Body;
use axum::body::to_bytes;
use axum::http::Request;
use axum::http::StatusCode;
use podsim_broker::InProcessBroker;
use podsim_core::Aggregator;
use podsim_core::Dispatcher;
use podsim_core::InMemoryProgressChannel;
use podsim_core::ProgressStreamer;
use podsim_core::RecoveryEngine;
use podsim_core::RecoveryThresholds;
use podsim_core::StaticDeckResolver;
use podsim_core::StreamerConfig;
use podsim_core::SummaryIngestor;
use podsim_core::FsBlobStore;
use podsim_protocol::SimState;
use podsim_server::AppState;
use podsim_server::WORKER_SECRET_HEADER;
use podsim_server::build_router;
use podsim_state::SqliteStore;
use podsim_state::Store;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Arc<dyn Store>,
    _data_dir: TempDir,
}

async fn app_with_secret(secret: Option<&str>) -> TestApp {
    let data_dir = TempDir::new().expect("tempdir");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::init(data_dir.path().to_path_buf())
            .await
            .expect("store"),
    );
    let broker = Arc::new(InProcessBroker::new(Duration::from_secs(3600)));
    let progress = Arc::new(InMemoryProgressChannel::new());
    let blob = Arc::new(FsBlobStore::new(data_dir.path().join("blobs")));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        broker,
        Arc::new(StaticDeckResolver::default()),
        progress.clone(),
    ));
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        blob,
        Arc::new(SummaryIngestor),
        progress.clone(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        store.clone(),
        dispatcher.clone(),
        aggregator.clone(),
        RecoveryThresholds::default(),
    ));
    let streamer = Arc::new(ProgressStreamer::new(
        store.clone(),
        progress.clone(),
        recovery.clone(),
        StreamerConfig::default(),
    ));
    let state = AppState {
        store: store.clone(),
        dispatcher,
        aggregator,
        recovery,
        streamer,
        progress,
        worker_shared_secret: secret.map(str::to_string),
    };
    TestApp {
        router: build_router(state),
        store,
        _data_dir: data_dir,
    }
}

async fn app() -> TestApp {
    app_with_secret(None).await
}

fn create_body() -> Value {
    json!({
        "decks": [
            { "name": "Atraxa", "content": "1 Atraxa" },
            { "name": "Krenko", "content": "1 Krenko" },
            { "name": "Meren", "content": "1 Meren" },
            { "name": "Talrand", "content": "1 Talrand" },
        ],
        "simulations": 8,
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn patch_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn create_then_get_job() {
    let app = app().await;
    let (status, created) = send(&app.router, post_json("/jobs", &create_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "QUEUED");
    assert_eq!(created["totalSimCount"], 2);
    let id = created["id"].as_str().expect("id");

    let (status, fetched) = send(
        &app.router,
        Request::builder()
            .uri(format!("/jobs/{id}"))
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);
}

#[tokio::test]
async fn invalid_simulation_count_is_400() {
    let app = app().await;
    let mut body = create_body();
    body["simulations"] = json!(2);
    let (status, error) = send(&app.router, post_json("/jobs", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation");
}

#[tokio::test]
async fn missing_job_is_404() {
    let app = app().await;
    let (status, _) = send(
        &app.router,
        Request::builder()
            .uri("/jobs/nope")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stale_worker_transition_gets_200_with_updated_false() {
    let app = app().await;
    let (_, created) = send(&app.router, post_json("/jobs", &create_body())).await;
    let id = created["id"].as_str().expect("id").to_string();
    app.store
        .update_simulation_status(
            &id,
            "sim_000",
            podsim_protocol::SimulationPatch {
                state: Some(SimState::Completed),
                ..Default::default()
            },
        )
        .await
        .expect("force complete");

    // A stale worker tries to re-run the completed sim.
    let (status, body) = send(
        &app.router,
        patch_json(
            &format!("/jobs/{id}/simulations/sim_000"),
            &json!({ "state": "RUNNING" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], false);
    assert_eq!(body["reason"], "terminal_state");
    assert_eq!(body["from"], "COMPLETED");

    let sim = app
        .store
        .get_simulation_status(&id, "sim_000")
        .await
        .expect("store")
        .expect("sim");
    assert_eq!(sim.state, SimState::Completed);
}

#[tokio::test]
async fn worker_sim_update_applies_and_mirrors_legacy_fields() {
    let app = app().await;
    let (_, created) = send(&app.router, post_json("/jobs", &create_body())).await;
    let id = created["id"].as_str().expect("id").to_string();

    let (status, body) = send(
        &app.router,
        patch_json(
            &format!("/jobs/{id}/simulations/sim_000"),
            &json!({ "state": "RUNNING", "workerId": "w9" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], true);

    let (_, body) = send(
        &app.router,
        patch_json(
            &format!("/jobs/{id}/simulations/sim_000"),
            &json!({ "state": "COMPLETED", "winner": "Krenko", "winningTurn": 9, "durationMs": 61000 }),
        ),
    )
    .await;
    assert_eq!(body["updated"], true);

    let sim = app
        .store
        .get_simulation_status(&id, "sim_000")
        .await
        .expect("store")
        .expect("sim");
    assert_eq!(sim.state, SimState::Completed);
    assert_eq!(sim.winners, vec!["Krenko".to_string()]);
    assert_eq!(sim.winning_turns, vec![9]);

    // The terminal write advanced the job counter.
    let job = app.store.get_job(&id).await.expect("store").expect("job");
    assert_eq!(job.completed_sim_count, 1);
}

#[tokio::test]
async fn cancel_is_idempotent_and_reports_effect() {
    let app = app().await;
    let (_, created) = send(&app.router, post_json("/jobs", &create_body())).await;
    let id = created["id"].as_str().expect("id").to_string();

    let delete = |uri: String| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    };
    let (status, body) = send(&app.router, delete(format!("/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (_, body) = send(&app.router, delete(format!("/jobs/{id}"))).await;
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn worker_routes_enforce_shared_secret() {
    let app = app_with_secret(Some("hunter2")).await;
    let (_, created) = send(&app.router, post_json("/jobs", &create_body())).await;
    let id = created["id"].as_str().expect("id").to_string();

    let uri = format!("/jobs/{id}/simulations/sim_000");
    let body = json!({ "state": "RUNNING" });
    let (status, _) = send(&app.router, patch_json(&uri, &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authed = Request::builder()
        .method("PATCH")
        .uri(&uri)
        .header("content-type", "application/json")
        .header(WORKER_SECRET_HEADER, "hunter2")
        .body(Body::from(body.to_string()))
        .expect("request");
    let (status, response) = send(&app.router, authed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["updated"], true);
}

#[tokio::test]
async fn heartbeat_then_worker_listing() {
    let app = app().await;
    let beat = json!({
        "workerId": "w1",
        "workerName": "rig-1",
        "status": "idle",
        "capacity": 4,
        "activeSimulations": 0,
        "uptimeMs": 1234,
        "lastHeartbeat": chrono::Utc::now().to_rfc3339(),
    });
    let (status, body) = send(&app.router, post_json("/workers/heartbeat", &beat)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, workers) = send(
        &app.router,
        Request::builder()
            .uri("/workers")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(workers.as_array().expect("array").len(), 1);
    assert_eq!(workers[0]["workerId"], "w1");
}

#[tokio::test]
async fn retry_requires_failed_job() {
    let app = app().await;
    let (_, created) = send(&app.router, post_json("/jobs", &create_body())).await;
    let id = created["id"].as_str().expect("id").to_string();

    let (status, _) = send(
        &app.router,
        post_json(&format!("/jobs/{id}/retry"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.store
        .set_job_failed(&id, "exploded", None)
        .await
        .expect("fail job");
    let (status, body) = send(
        &app.router,
        post_json(&format!("/jobs/{id}/retry"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "QUEUED");
    assert_eq!(body["retryCount"], 1);
}
