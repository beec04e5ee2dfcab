use crate::common::create_request;
use crate::common::harness;
use podsim_core::raw_log_path;
use podsim_core::BlobStore;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_state::Store;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn aggregation_completes_job_and_writes_ratings() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.blob
        .put(&raw_log_path(&job.id, 1), b"game log one".to_vec())
        .await
        .unwrap();
    h.blob
        .put(&raw_log_path(&job.id, 2), b"game log two".to_vec())
        .await
        .unwrap();
    h.complete_sim(&job, "sim_000", vec!["Krenko", "Krenko", "Atraxa", "Meren"])
        .await;
    h.complete_sim(&job, "sim_001", vec!["Krenko", "Talrand", "Atraxa", "Krenko"])
        .await;

    h.aggregator.aggregate(&job.id).await.unwrap();

    let finished = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(!finished.needs_aggregation);
    let results = finished.results.expect("results artifact");
    assert_eq!(results["gamesPlayed"], 8);
    assert_eq!(results["winCounts"]["Krenko"], 4);
    assert_eq!(results["rawLogCount"], 2);
    assert_eq!(finished.docker_run_durations_ms.len(), 2);

    // Ratings: Krenko won half the games, its displayed skill must lead.
    assert!(h.store.has_match_results(&job.id).await.unwrap());
    let ratings = h
        .store
        .get_deck_ratings(&job.deck_ids.clone().unwrap())
        .await
        .unwrap();
    assert_eq!(ratings.len(), 4);
    let krenko = ratings.iter().find(|r| r.deck_id == "deck-b").unwrap();
    assert_eq!(krenko.games_played, 8);
    assert_eq!(krenko.wins, 4);
    for other in ratings.iter().filter(|r| r.deck_id != "deck-b") {
        assert!(krenko.mu > other.mu);
    }
}

#[tokio::test]
async fn aggregation_is_idempotent() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.complete_sim(&job, "sim_000", vec!["Krenko", "Krenko", "Atraxa", "Meren"])
        .await;
    h.complete_sim(&job, "sim_001", vec!["Krenko", "Talrand", "Atraxa", "Krenko"])
        .await;

    h.aggregator.aggregate(&job.id).await.unwrap();
    let first = h.store.get_job(&job.id).await.unwrap().unwrap();
    let ratings_first = h
        .store
        .get_deck_ratings(&job.deck_ids.clone().unwrap())
        .await
        .unwrap();

    // Redelivered aggregation trigger: guarded by the COMPLETED status and
    // by the match-result rows.
    h.aggregator.aggregate(&job.id).await.unwrap();
    let second = h.store.get_job(&job.id).await.unwrap().unwrap();
    let ratings_second = h
        .store
        .get_deck_ratings(&job.deck_ids.clone().unwrap())
        .await
        .unwrap();

    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(first.results, second.results);
    for (a, b) in ratings_first.iter().zip(ratings_second.iter()) {
        assert_eq!(a.mu.to_bits(), b.mu.to_bits());
        assert_eq!(a.sigma.to_bits(), b.sigma.to_bits());
        assert_eq!(a.games_played, b.games_played);
    }
}

#[tokio::test]
async fn aggregation_waits_for_failed_sims() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.complete_sim(&job, "sim_000", vec!["Krenko", "Krenko", "Atraxa", "Meren"])
        .await;
    h.set_sim_state(&job.id, "sim_001", SimState::Failed).await;

    h.aggregator.aggregate(&job.id).await.unwrap();
    let job_after = h.store.get_job(&job.id).await.unwrap().unwrap();
    // FAILED sims will be retried; the job must not settle.
    assert_eq!(job_after.status, JobStatus::Running);
    assert!(job_after.results.is_none());
}

/// Cancellation under load: one COMPLETED sim exists, so its logs are
/// ingested, but the job is never promoted out of CANCELLED.
#[tokio::test]
async fn cancelled_job_keeps_status_but_ingests_logs() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(16)).await.unwrap();
    h.store
        .update_job_status(&job.id, JobStatus::Running)
        .await
        .unwrap();
    h.complete_sim(&job, "sim_000", vec!["Krenko", "Krenko", "Atraxa", "Meren"])
        .await;
    h.set_sim_state(&job.id, "sim_001", SimState::Running).await;

    assert!(h.store.cancel_job(&job.id).await.unwrap());
    let sims = h.store.get_simulation_statuses(&job.id).await.unwrap();
    assert_eq!(sims[0].state, SimState::Completed);
    assert!(sims[1..].iter().all(|sim| sim.state == SimState::Cancelled));

    h.aggregator.aggregate(&job.id).await.unwrap();
    let after = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    let results = after.results.expect("logs still ingested");
    assert_eq!(results["gamesPlayed"], 4);
}

#[tokio::test]
async fn fully_cancelled_job_is_left_untouched() {
    let h = harness().await;
    let job = h.dispatcher.create_job(create_request(8)).await.unwrap();
    assert!(h.store.cancel_job(&job.id).await.unwrap());

    h.aggregator.aggregate(&job.id).await.unwrap();
    let after = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert!(after.results.is_none());
    assert!(!h.store.has_match_results(&job.id).await.unwrap());
}
