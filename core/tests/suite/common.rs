use chrono::Utc;
use podsim_broker::InProcessBroker;
use podsim_core::Aggregator;
use podsim_core::CreateJobRequest;
use podsim_core::Dispatcher;
use podsim_core::FsBlobStore;
use podsim_core::InMemoryProgressChannel;
use podsim_core::ProgressStreamer;
use podsim_core::RecoveryEngine;
use podsim_core::RecoveryThresholds;
use podsim_core::StaticDeckResolver;
use podsim_core::StreamerConfig;
use podsim_core::SummaryIngestor;
use podsim_protocol::DeckDescriptor;
use podsim_protocol::Job;
use podsim_protocol::SimState;
use podsim_protocol::SimulationPatch;
use podsim_protocol::WorkerInfo;
use podsim_protocol::WorkerStatus;
use podsim_state::SqliteStore;
use podsim_state::Store;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub broker: Arc<InProcessBroker>,
    pub progress: Arc<InMemoryProgressChannel>,
    pub blob: Arc<FsBlobStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub aggregator: Arc<Aggregator>,
    pub recovery: Arc<RecoveryEngine>,
    _data_dir: TempDir,
}

/// Thresholds of zero so recovery acts immediately in tests; the cooldown
/// is also zero so consecutive passes are allowed to republish.
pub fn instant_thresholds() -> RecoveryThresholds {
    RecoveryThresholds {
        queued_stuck: Duration::ZERO,
        pending_stuck: Duration::ZERO,
        running_stuck: Duration::from_secs(150 * 60),
        republish_cooldown: Duration::ZERO,
    }
}

pub async fn harness() -> Harness {
    harness_with(instant_thresholds()).await
}

pub async fn harness_with(thresholds: RecoveryThresholds) -> Harness {
    let data_dir = TempDir::new().expect("tempdir");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::init(data_dir.path().to_path_buf())
            .await
            .expect("open store"),
    );
    let broker = Arc::new(InProcessBroker::new(Duration::from_secs(3600)));
    let progress = Arc::new(InMemoryProgressChannel::new());
    let blob = Arc::new(FsBlobStore::new(data_dir.path().join("blobs")));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        broker.clone(),
        Arc::new(StaticDeckResolver::default()),
        progress.clone(),
    ));
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        blob.clone(),
        Arc::new(SummaryIngestor),
        progress.clone(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        store.clone(),
        dispatcher.clone(),
        aggregator.clone(),
        thresholds,
    ));
    Harness {
        store,
        broker,
        progress,
        blob,
        dispatcher,
        aggregator,
        recovery,
        _data_dir: data_dir,
    }
}

impl Harness {
    pub fn streamer(&self, config: StreamerConfig) -> Arc<ProgressStreamer> {
        Arc::new(ProgressStreamer::new(
            self.store.clone(),
            self.progress.clone(),
            self.recovery.clone(),
            config,
        ))
    }

    pub async fn register_worker(&self, worker_id: &str) {
        self.store
            .upsert_worker_heartbeat(WorkerInfo {
                worker_id: worker_id.to_string(),
                worker_name: format!("{worker_id}-host"),
                status: WorkerStatus::Idle,
                current_job_id: None,
                capacity: 4,
                active_simulations: 0,
                uptime_ms: 1000,
                last_heartbeat: Utc::now(),
                version: None,
                max_concurrent_override: None,
                owner_email: None,
            })
            .await
            .expect("heartbeat");
    }

    pub async fn set_sim_state(&self, job_id: &str, sim_id: &str, state: SimState) {
        self.store
            .update_simulation_status(
                job_id,
                sim_id,
                SimulationPatch {
                    state: Some(state),
                    ..Default::default()
                },
            )
            .await
            .expect("update sim");
    }

    pub async fn complete_sim(&self, job: &Job, sim_id: &str, winners: Vec<&str>) {
        self.store
            .update_simulation_status(
                &job.id,
                sim_id,
                SimulationPatch {
                    state: Some(SimState::Completed),
                    completed_at: Some(Utc::now()),
                    duration_ms: Some(60_000),
                    winners: Some(winners.iter().map(|w| w.to_string()).collect()),
                    winning_turns: Some(winners.iter().enumerate().map(|(i, _)| 7 + i as u32).collect()),
                    ..Default::default()
                },
            )
            .await
            .expect("complete sim");
    }
}

pub fn test_decks() -> Vec<DeckDescriptor> {
    ["Atraxa", "Krenko", "Meren", "Talrand"]
        .into_iter()
        .map(|name| DeckDescriptor {
            name: name.to_string(),
            content: format!("1 {name}\n99 other cards"),
        })
        .collect()
}

pub fn create_request(simulations: u32) -> CreateJobRequest {
    CreateJobRequest {
        deck_ids: Some(vec![
            "deck-a".into(),
            "deck-b".into(),
            "deck-c".into(),
            "deck-d".into(),
        ]),
        decks: Some(test_decks()),
        simulations,
        parallelism: None,
        idempotency_key: None,
        created_by: "tester".to_string(),
    }
}
