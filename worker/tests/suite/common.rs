use async_trait::async_trait;
use podsim_broker::InProcessBroker;
use podsim_core::Aggregator;
use podsim_core::Config;
use podsim_core::CreateJobRequest;
use podsim_core::Dispatcher;
use podsim_core::FsBlobStore;
use podsim_core::InMemoryProgressChannel;
use podsim_core::StaticDeckResolver;
use podsim_core::SummaryIngestor;
use podsim_protocol::DeckDescriptor;
use podsim_state::SqliteStore;
use podsim_state::Store;
use podsim_worker::ContainerRun;
use podsim_worker::ContainerRuntime;
use podsim_worker::EXIT_CANCELLED;
use podsim_worker::ResultLineParser;
use podsim_worker::RunOutcome;
use podsim_worker::RunRequest;
use podsim_worker::WorkerRuntime;
use podsim_worker::WorkerState;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Scripted container runtime: per-sim outcomes, run counting, optional
/// blocking until cancelled.
#[derive(Default)]
pub struct FakeContainers {
    outcomes: Mutex<HashMap<String, ScriptedOutcome>>,
    pub runs: AtomicU32,
}

#[derive(Clone)]
pub enum ScriptedOutcome {
    /// Exit 0 with a log naming these winners.
    Win(Vec<&'static str>),
    /// Non-zero exit with this stderr.
    Fail(&'static str),
    /// Report AlreadyRunning.
    Duplicate,
    /// Block until the cancellation token fires, then exit 137.
    RunUntilCancelled,
}

impl FakeContainers {
    pub fn script(&self, sim_id: &str, outcome: ScriptedOutcome) {
        self.lock().insert(sim_id.to_string(), outcome);
    }

    pub fn run_count(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScriptedOutcome>> {
        match self.outcomes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainers {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .lock()
            .get(&request.sim_id)
            .cloned()
            .unwrap_or(ScriptedOutcome::Win(vec![
                "Atraxa", "Krenko", "Meren", "Talrand",
            ]));
        let run = match outcome {
            ScriptedOutcome::Win(winners) => {
                let log_text = winners
                    .iter()
                    .enumerate()
                    .map(|(game, winner)| {
                        format!("RESULT game={} winner={winner} turn={}\n", game + 1, game + 6)
                    })
                    .collect::<String>();
                ContainerRun {
                    exit_code: 0,
                    duration_ms: 1500,
                    log_text,
                    error: None,
                }
            }
            ScriptedOutcome::Fail(stderr) => ContainerRun {
                exit_code: 1,
                duration_ms: 700,
                log_text: String::new(),
                error: Some(stderr.to_string()),
            },
            ScriptedOutcome::Duplicate => return Ok(RunOutcome::AlreadyRunning),
            ScriptedOutcome::RunUntilCancelled => {
                cancel.cancelled().await;
                ContainerRun {
                    exit_code: EXIT_CANCELLED,
                    duration_ms: 300,
                    log_text: String::new(),
                    error: Some("Cancelled".to_string()),
                }
            }
        };
        Ok(RunOutcome::Finished(run))
    }

    async fn prune_orphans(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct WorkerHarness {
    pub store: Arc<dyn Store>,
    pub broker: Arc<InProcessBroker>,
    pub blob: Arc<FsBlobStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub containers: Arc<FakeContainers>,
    pub runtime: Arc<WorkerRuntime>,
    _data_dir: TempDir,
}

pub async fn worker_harness(capacity: u32) -> WorkerHarness {
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
    let containers = Arc::new(FakeContainers::default());
    let state = Arc::new(WorkerState::new(
        "w-test".to_string(),
        "test-host".to_string(),
        capacity,
    ));
    let runtime = Arc::new(WorkerRuntime::new(
        store.clone(),
        broker.clone(),
        blob.clone(),
        aggregator,
        containers.clone(),
        Arc::new(ResultLineParser),
        progress,
        Arc::new(Config::default()),
        state,
    ));
    WorkerHarness {
        store,
        broker,
        blob,
        dispatcher,
        containers,
        runtime,
        _data_dir: data_dir,
    }
}

pub fn test_decks() -> Vec<DeckDescriptor> {
    ["Atraxa", "Krenko", "Meren", "Talrand"]
        .into_iter()
        .map(|name| DeckDescriptor {
            name: name.to_string(),
            content: format!("1 {name}"),
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
