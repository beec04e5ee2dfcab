use crate::common::create_request;
use crate::common::harness;
use podsim_broker::TaskBroker;
use podsim_core::CoreError;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_state::Store;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn create_job_initializes_sims_and_publishes_tasks() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.total_sim_count, 2);

    let sims = h.store.get_simulation_statuses(&job.id).await.unwrap();
    assert_eq!(sims.len(), 2);
    assert!(sims.iter().all(|sim| sim.state == SimState::Pending));
    assert_eq!(sims[0].sim_id, "sim_000");
    assert_eq!(sims[1].sim_id, "sim_001");

    assert_eq!(h.broker.ready_count(), 2);
    let first = h.broker.pull().await.unwrap();
    assert_eq!(first.task.job_id, job.id);
    assert_eq!(first.task.total_sims, 2);
    h.broker.ack(&first).await.unwrap();
}

#[tokio::test]
async fn simulations_out_of_bounds_are_rejected_before_store() {
    let h = harness().await;
    for simulations in [0, 3, 101] {
        let err = h
            .dispatcher
            .create_job(create_request(simulations))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
    assert!(h.store.list_jobs(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn bad_parallelism_is_rejected() {
    let h = harness().await;
    let mut request = create_request(8);
    request.parallelism = Some(17);
    let err = h.dispatcher.create_job(request).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn missing_decks_and_ids_is_rejected() {
    let h = harness().await;
    let mut request = create_request(8);
    request.decks = None;
    request.deck_ids = None;
    let err = h.dispatcher.create_job(request).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn idempotent_create_returns_same_job() {
    let h = harness().await;
    let mut request = create_request(8);
    request.idempotency_key = Some("create-once".to_string());
    let first = h.dispatcher.create_job(request.clone()).await.unwrap();
    let second = h.dispatcher.create_job(request).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.store.list_jobs(None, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn publish_pending_skips_claimed_sims() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();

    // Drain the initial publishes and claim one sim.
    while h.broker.ready_count() > 0 {
        let delivery = h.broker.pull().await.unwrap();
        h.broker.ack(&delivery).await.unwrap();
    }
    h.set_sim_state(&job.id, "sim_000", SimState::Running).await;

    let published = h.dispatcher.publish_pending_sims(&job.id).await.unwrap();
    assert_eq!(published, 1);
    let delivery = h.broker.pull().await.unwrap();
    assert_eq!(delivery.task.sim_id, "sim_001");
    h.broker.ack(&delivery).await.unwrap();
}
