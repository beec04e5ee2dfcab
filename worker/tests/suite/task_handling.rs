use crate::common::create_request;
use crate::common::worker_harness;
use crate::common::ScriptedOutcome;
use podsim_broker::SimTask;
use podsim_broker::TaskBroker;
use podsim_core::raw_log_path;
use podsim_core::BlobStore;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_state::Store;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn task(job_id: &str, index: u32, total: u32) -> SimTask {
    SimTask {
        job_id: job_id.to_string(),
        sim_id: format!("sim_{index:03}"),
        sim_index: index,
        total_sims: total,
    }
}

#[tokio::test]
async fn happy_path_completes_sim_with_winners_and_log() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();

    h.runtime.process_task(&task(&job.id, 0, 2)).await;

    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Completed);
    assert_eq!(sim.worker_id.as_deref(), Some("w-test"));
    assert_eq!(sim.winners.len(), 4);
    assert_eq!(sim.winners[0], "Atraxa");
    assert_eq!(sim.winning_turns, vec![6, 7, 8, 9]);
    assert!(sim.duration_ms.is_some());
    assert!(sim.completed_at.unwrap() >= sim.started_at.unwrap());

    // Raw log uploaded before the terminal write, 1-based index.
    let log = h
        .blob
        .get(&raw_log_path(&job.id, 1))
        .await
        .unwrap()
        .expect("raw log blob");
    assert!(String::from_utf8_lossy(&log).contains("RESULT game=1 winner=Atraxa"));

    // First sim flips the job RUNNING; counter advanced to 1 of 2.
    let job_row = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_row.status, JobStatus::Running);
    assert_eq!(job_row.completed_sim_count, 1);
    assert_eq!(job_row.worker_id.as_deref(), Some("w-test"));
}

#[tokio::test]
async fn last_terminal_sim_triggers_aggregation() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();

    h.runtime.process_task(&task(&job.id, 0, 2)).await;
    h.runtime.process_task(&task(&job.id, 1, 2)).await;

    let finished = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.completed_sim_count, 2);
    assert!(finished.results.is_some());
    assert!(h.store.has_match_results(&job.id).await.unwrap());
}

/// At-least-once safety: the same task delivered N times produces exactly
/// one terminal transition and one container run.
#[tokio::test]
async fn redelivered_task_is_a_noop_after_completion() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    let t = task(&job.id, 0, 2);

    h.runtime.process_task(&t).await;
    let first = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();

    h.runtime.process_task(&t).await;
    h.runtime.process_task(&t).await;

    let after = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, first);
    assert_eq!(h.containers.run_count(), 1);
    let job_row = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_row.completed_sim_count, 1);
}

#[tokio::test]
async fn task_for_cancelled_job_cancels_the_sim() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    assert!(h.store.cancel_job(&job.id).await.unwrap());
    // cancel_job cascaded PENDING sims, so reset one to PENDING to model a
    // task racing the cascade.
    h.store
        .update_simulation_status(
            &job.id,
            "sim_000",
            podsim_protocol::SimulationPatch {
                state: Some(SimState::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.runtime.process_task(&task(&job.id, 0, 2)).await;

    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Cancelled);
    assert_eq!(sim.error_message.as_deref(), Some("Cancelled"));
    // The container never started.
    assert_eq!(h.containers.run_count(), 0);
}

#[tokio::test]
async fn failed_container_marks_sim_failed_with_stderr() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.containers
        .script("sim_000", ScriptedOutcome::Fail("deck list invalid"));

    h.runtime.process_task(&task(&job.id, 0, 2)).await;

    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Failed);
    assert_eq!(sim.error_message.as_deref(), Some("deck list invalid"));

    // FAILED is retryable, not terminal: the counter must not move.
    let job_row = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job_row.completed_sim_count, 0);
}

#[tokio::test]
async fn already_running_sentinel_leaves_sim_running() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.containers.script("sim_000", ScriptedOutcome::Duplicate);

    h.runtime.process_task(&task(&job.id, 0, 2)).await;

    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    // The original delivery still owns the container and will settle it.
    assert_eq!(sim.state, SimState::Running);
}

#[tokio::test]
async fn failed_sim_can_be_reclaimed_and_completed() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.containers
        .script("sim_000", ScriptedOutcome::Fail("transient"));
    h.runtime.process_task(&task(&job.id, 0, 2)).await;
    assert_eq!(
        h.store
            .get_simulation_status(&job.id, "sim_000")
            .await
            .unwrap()
            .unwrap()
            .state,
        SimState::Failed
    );

    // The claim accepts FAILED, so the retry delivery runs the container
    // again without waiting for a recovery reset.
    h.containers.script(
        "sim_000",
        ScriptedOutcome::Win(vec!["Krenko", "Krenko", "Meren", "Talrand"]),
    );
    h.runtime.process_task(&task(&job.id, 0, 2)).await;
    let sim = h
        .store
        .get_simulation_status(&job.id, "sim_000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sim.state, SimState::Completed);
    assert_eq!(sim.winners[0], "Krenko");
}

/// End-to-end through the broker loop: publish, run the worker, watch the
/// job complete, then shut the worker down.
#[tokio::test]
async fn broker_loop_drains_a_job_end_to_end() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();

    let shutdown = CancellationToken::new();
    let loop_handle = tokio::spawn(h.runtime.clone().run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = h.store.get_job(&job.id).await.unwrap().unwrap();
        if current.status == JobStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not complete in time, status {:?}",
            current.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    loop_handle.await.unwrap().unwrap();
    assert_eq!(h.containers.run_count(), 2);
    assert_eq!(h.broker.inflight_count(), 0);
}

/// Cancellation under load: a running container aborts with exit 137 and
/// the handler records CANCELLED.
#[tokio::test]
async fn cancellation_aborts_inflight_containers() {
    let h = worker_harness(2).await;
    let job = h.dispatcher.create_job(create_request(4)).await.unwrap();
    h.containers
        .script("sim_000", ScriptedOutcome::RunUntilCancelled);

    let shutdown = CancellationToken::new();
    let loop_handle = tokio::spawn(h.runtime.clone().run(shutdown.clone()));

    // Wait until the sim is claimed and the container is "running".
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let sim = h
            .store
            .get_simulation_status(&job.id, "sim_000")
            .await
            .unwrap()
            .unwrap();
        if sim.state == SimState::Running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "sim never claimed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(h.store.cancel_job(&job.id).await.unwrap());
    // cancel_job already cascades the sim row; the worker's watcher also
    // aborts the container, whose 137 exit resolves as a lost race.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let sim = h
            .store
            .get_simulation_status(&job.id, "sim_000")
            .await
            .unwrap()
            .unwrap();
        if sim.state == SimState::Cancelled {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sim never cancelled"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    loop_handle.await.unwrap().unwrap();
}
