use crate::common::create_request;
use crate::common::harness;
use crate::common::test_decks;
use chrono::Utc;
use podsim_broker::TaskBroker;
use podsim_protocol::CreateJobParams;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::SimulationPatch;
use podsim_state::Store;
use pretty_assertions::assert_eq;

/// Dispatcher crashed between `create_job` and `initialize_simulations`:
/// recovery must finish the dispatch on its own.
#[tokio::test]
async fn stuck_queued_job_without_sims_is_fully_dispatched() {
    let h = harness().await;
    h.register_worker("w1").await;
    let job = h
        .store
        .create_job(CreateJobParams {
            decks: test_decks(),
            deck_ids: None,
            simulations: 8,
            parallelism: 4,
            idempotency_key: None,
            created_by: "tester".to_string(),
        })
        .await
        .unwrap();
    assert!(h.store.get_simulation_statuses(&job.id).await.unwrap().is_empty());

    let report = h.recovery.recover_job(&job.id).await.unwrap();
    assert!(report.sims_initialized);
    assert_eq!(report.tasks_republished, 2);

    let sims = h.store.get_simulation_statuses(&job.id).await.unwrap();
    assert_eq!(sims.len(), 2);
    assert_eq!(h.broker.ready_count(), 2);
}

#[tokio::test]
async fn stuck_queued_job_is_not_redriven_without_workers() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    // Drain initial publishes to observe recovery's behavior alone.
    while h.broker.ready_count() > 0 {
        let delivery = h.broker.pull().await.unwrap();
        h.broker.ack(&delivery).await.unwrap();
    }

    let report = h.recovery.recover_job(&job.id).await.unwrap();
    assert!(!report.acted());
    assert_eq!(h.broker.ready_count(), 0);
}

#[tokio::test]
async fn orphaned_running_sim_is_failed_then_retried() {
    let h = harness().await;
    h.register_worker("w-alive").await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    while h.broker.ready_count() > 0 {
        let delivery = h.broker.pull().await.unwrap();
        h.broker.ack(&delivery).await.unwrap();
    }
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    // Claimed by a worker that never heartbeated.
    h.store
        .update_simulation_status(
            &job.id,
            "sim_000",
            SimulationPatch {
                state: Some(SimState::Running),
                worker_id: Some("w-dead".to_string()),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.set_sim_state(&job.id, "sim_001", SimState::Completed).await;

    // First pass: orphan detected and failed.
    let report = h.recovery.recover_job(&job.id).await.unwrap();
    assert_eq!(report.sims_failed, 1);
    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Failed);
    assert_eq!(sim.error_message.as_deref(), Some("Worker lost connection"));

    // Next tick: FAILED resets to PENDING and the task goes back out.
    let report = h.recovery.recover_job(&job.id).await.unwrap();
    assert_eq!(report.sims_reset, 1);
    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Pending);
    assert_eq!(h.broker.ready_count(), 1);

    let delivery = h.broker.pull().await.unwrap();
    assert_eq!(delivery.task.sim_id, "sim_000");
    h.broker.ack(&delivery).await.unwrap();
}

#[tokio::test]
async fn failed_sims_are_reset_and_republished() {
    let h = harness().await;
    h.register_worker("w1").await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    while h.broker.ready_count() > 0 {
        let delivery = h.broker.pull().await.unwrap();
        h.broker.ack(&delivery).await.unwrap();
    }
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.set_sim_state(&job.id, "sim_000", SimState::Failed).await;
    h.set_sim_state(&job.id, "sim_001", SimState::Completed).await;

    let report = h.recovery.recover_job(&job.id).await.unwrap();
    assert_eq!(report.sims_reset, 1);
    assert_eq!(report.tasks_republished, 1);

    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Pending);
}

#[tokio::test]
async fn failed_sims_wait_when_no_workers_are_active() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.set_sim_state(&job.id, "sim_000", SimState::Failed).await;

    let report = h.recovery.recover_job(&job.id).await.unwrap();
    assert_eq!(report.sims_reset, 0);
    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Failed);
}

/// Two passes over the same settled job must produce the same store state
/// as one pass.
#[tokio::test]
async fn recovery_is_idempotent_over_settled_jobs() {
    let h = harness().await;
    h.register_worker("w1").await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.complete_sim(&job, "sim_000", vec!["Krenko", "Atraxa", "Krenko", "Meren"])
        .await;
    h.complete_sim(&job, "sim_001", vec!["Talrand", "Krenko", "Atraxa", "Meren"])
        .await;

    let first = h.recovery.recover_job(&job.id).await.unwrap();
    assert!(first.aggregation_kicked);
    let after_first = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Completed);

    let second = h.recovery.recover_job(&job.id).await.unwrap();
    assert!(!second.acted());
    let after_second = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, after_second.status);
    assert_eq!(after_first.completed_at, after_second.completed_at);
    assert_eq!(after_first.results, after_second.results);
}

/// Worker crash mid-run: recovery fails the orphan, resets it, a healthy
/// worker finishes, and the job completes.
#[tokio::test]
async fn worker_crash_mid_run_ends_in_completed_job() {
    let h = harness().await;
    h.register_worker("w2").await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    while h.broker.ready_count() > 0 {
        let delivery = h.broker.pull().await.unwrap();
        h.broker.ack(&delivery).await.unwrap();
    }
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.complete_sim(&job, "sim_001", vec!["Krenko", "Atraxa", "Meren", "Talrand"])
        .await;
    h.store
        .update_simulation_status(
            &job.id,
            "sim_000",
            SimulationPatch {
                state: Some(SimState::Running),
                worker_id: Some("w1-vanished".to_string()),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Two recovery ticks: orphan -> FAILED, then FAILED -> PENDING with a
    // republish.
    h.recovery.recover_job(&job.id).await.unwrap();
    h.recovery.recover_job(&job.id).await.unwrap();
    let delivery = h.broker.pull().await.unwrap();
    assert_eq!(delivery.task.sim_id, "sim_000");
    h.broker.ack(&delivery).await.unwrap();

    // The healthy worker completes it.
    h.complete_sim(&job, "sim_000", vec!["Atraxa", "Atraxa", "Krenko", "Meren"])
        .await;
    h.recovery.recover_job(&job.id).await.unwrap();

    let finished = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
}
