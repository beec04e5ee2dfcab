use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::SimulationPatch;
use podsim_protocol::WorkerInfo;
use podsim_protocol::WorkerStatus;
use podsim_state::FirestoreConfig;
use podsim_state::FirestoreStore;
use podsim_state::Store;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_partial_json;
use wiremock::matchers::method;
use wiremock::matchers::path;

const DOCS_ROOT: &str = "/projects/test-project/databases/(default)/documents";

async fn store_for(server: &MockServer) -> FirestoreStore {
    let config = FirestoreConfig::new("test-project").with_base_url(server.uri());
    FirestoreStore::new(config).expect("client")
}

fn job_document(id: &str, status: &str) -> Value {
    json!({
        "name": format!("projects/test-project/databases/(default)/documents/jobs/{id}"),
        "fields": {
            "id": { "stringValue": id },
            "createdAt": { "timestampValue": "2026-03-01T10:00:00.000Z" },
            "createdBy": { "stringValue": "alice" },
            "decks": { "arrayValue": { "values": [] } },
            "simulations": { "integerValue": "8" },
            "parallelism": { "integerValue": "4" },
            "status": { "stringValue": status },
            "retryCount": { "integerValue": "0" },
            "completedSimCount": { "integerValue": "1" },
            "totalSimCount": { "integerValue": "2" },
            "needsAggregation": { "booleanValue": false },
        }
    })
}

fn sim_document(job_id: &str, sim_id: &str, state: &str) -> Value {
    json!({
        "name": format!(
            "projects/test-project/databases/(default)/documents/jobs/{job_id}/simulations/{sim_id}"
        ),
        "fields": {
            "jobId": { "stringValue": job_id },
            "simId": { "stringValue": sim_id },
            "index": { "integerValue": "0" },
            "state": { "stringValue": state },
        }
    })
}

#[tokio::test]
async fn get_job_returns_none_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{DOCS_ROOT}/jobs/missing")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": 404, "status": "NOT_FOUND" }
        })))
        .mount(&server)
        .await;

    let store = store_for(&server).await;
    assert!(store.get_job("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn get_job_decodes_document_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{DOCS_ROOT}/jobs/job-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_document("job-1", "RUNNING")))
        .mount(&server)
        .await;

    let store = store_for(&server).await;
    let job = store.get_job("job-1").await.unwrap().unwrap();
    assert_eq!(job.id, "job-1");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.completed_sim_count, 1);
    assert_eq!(job.total_sim_count, 2);
}

#[tokio::test]
async fn conditional_sim_update_applies_with_guarded_read() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:beginTransaction")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "transaction": "txn-1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DOCS_ROOT}/jobs/job-1/simulations/sim_000")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(sim_document("job-1", "sim_000", "PENDING")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:commit")))
        .and(body_partial_json(json!({ "transaction": "txn-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "writeResults": [{}] })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server).await;
    let updated = store
        .conditional_update_simulation_status(
            "job-1",
            "sim_000",
            &[SimState::Pending, SimState::Failed],
            SimulationPatch {
                state: Some(SimState::Running),
                worker_id: Some("w1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated);
}

#[tokio::test]
async fn conditional_sim_update_guard_mismatch_rolls_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:beginTransaction")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "transaction": "txn-2" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DOCS_ROOT}/jobs/job-1/simulations/sim_000")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(sim_document("job-1", "sim_000", "COMPLETED")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:rollback")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    // No commit may be issued.
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:commit")))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let store = store_for(&server).await;
    let updated = store
        .conditional_update_simulation_status(
            "job-1",
            "sim_000",
            &[SimState::Pending, SimState::Failed],
            SimulationPatch {
                state: Some(SimState::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated);
}

#[tokio::test]
async fn heartbeat_upsert_masks_only_carried_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:commit")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "writeResults": [{}] })))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server).await;
    store
        .upsert_worker_heartbeat(WorkerInfo {
            worker_id: "w1".into(),
            worker_name: "worker-1".into(),
            status: WorkerStatus::Busy,
            current_job_id: Some("job-1".into()),
            capacity: 4,
            active_simulations: 2,
            uptime_ms: 120_000,
            last_heartbeat: chrono::Utc::now(),
            version: None,
            max_concurrent_override: None,
            owner_email: None,
        })
        .await
        .unwrap();

    let requests = server.received_requests().await.expect("recording enabled");
    let body: Value = serde_json::from_slice(&requests[0].body).expect("json body");
    let mask: Vec<&str> = body["writes"][0]["updateMask"]["fieldPaths"]
        .as_array()
        .expect("field mask")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(mask.contains(&"status"));
    assert!(mask.contains(&"lastHeartbeat"));
    // The beat carried no operator overrides, so the merge must not touch
    // them.
    assert!(!mask.contains(&"maxConcurrentOverride"));
    assert!(!mask.contains(&"ownerEmail"));
}

#[tokio::test]
async fn commit_contention_is_not_an_error_for_guarded_writes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:beginTransaction")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "transaction": "txn-3" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DOCS_ROOT}/jobs/job-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(job_document("job-1", "QUEUED")))
        .mount(&server)
        .await;
    // Every commit attempt loses; the store retries and finally reports the
    // contention upward instead of claiming success.
    Mock::given(method("POST"))
        .and(path(format!("{DOCS_ROOT}:commit")))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": { "code": 409, "status": "ABORTED" }
        })))
        .mount(&server)
        .await;

    let store = store_for(&server).await;
    let result = store
        .conditional_update_job_status(
            "job-1",
            &[JobStatus::Queued],
            JobStatus::Running,
            Default::default(),
        )
        .await;
    assert!(result.is_err());
}
