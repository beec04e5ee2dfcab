use crate::decks::DeckResolver;
use crate::error::CoreError;
use crate::progress::ProgressChannel;
use futures::StreamExt;
use podsim_broker::SimTask;
use podsim_broker::TaskBroker;
use podsim_protocol::CreateJobParams;
use podsim_protocol::DECKS_PER_JOB;
use podsim_protocol::DeckDescriptor;
use podsim_protocol::DEFAULT_PARALLELISM;
use podsim_protocol::Job;
use podsim_protocol::JobStatus;
use podsim_protocol::MAX_PARALLELISM;
use podsim_protocol::MAX_SIMULATIONS;
use podsim_protocol::MIN_PARALLELISM;
use podsim_protocol::MIN_SIMULATIONS;
use podsim_protocol::SimState;
use podsim_protocol::container_count;
use podsim_state::Store;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Concurrent task publishes per job; publishing is fanned out but bounded.
const PUBLISH_CONCURRENCY: usize = 8;

/// A create request as it arrives from the HTTP surface: deck ids to be
/// resolved externally, or inline decks for local use.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub deck_ids: Option<Vec<String>>,
    pub decks: Option<Vec<DeckDescriptor>>,
    pub simulations: u32,
    pub parallelism: Option<u32>,
    pub idempotency_key: Option<String>,
    pub created_by: String,
}

/// Turns one accepted job into `ceil(N / K)` queued container tasks.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    broker: Arc<dyn TaskBroker>,
    resolver: Arc<dyn DeckResolver>,
    progress: Arc<dyn ProgressChannel>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn TaskBroker>,
        resolver: Arc<dyn DeckResolver>,
        progress: Arc<dyn ProgressChannel>,
    ) -> Self {
        Self {
            store,
            broker,
            resolver,
            progress,
        }
    }

    /// Validate, persist, initialize child rows, publish. A crash anywhere
    /// after `create_job` leaves a QUEUED job the recovery engine finishes
    /// driving; nothing here needs to be transactional across systems.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Job, CoreError> {
        if !(MIN_SIMULATIONS..=MAX_SIMULATIONS).contains(&request.simulations) {
            return Err(CoreError::Validation(format!(
                "simulations must be between {MIN_SIMULATIONS} and {MAX_SIMULATIONS}"
            )));
        }
        let parallelism = request.parallelism.unwrap_or(DEFAULT_PARALLELISM);
        if !(MIN_PARALLELISM..=MAX_PARALLELISM).contains(&parallelism) {
            return Err(CoreError::Validation(format!(
                "parallelism must be between {MIN_PARALLELISM} and {MAX_PARALLELISM}"
            )));
        }
        let decks = match (&request.decks, &request.deck_ids) {
            (Some(decks), _) => decks.clone(),
            (None, Some(deck_ids)) => {
                if deck_ids.len() != DECKS_PER_JOB {
                    return Err(CoreError::Validation(format!(
                        "expected {DECKS_PER_JOB} deck ids, got {}",
                        deck_ids.len()
                    )));
                }
                self.resolver.resolve(deck_ids).await?
            }
            (None, None) => {
                return Err(CoreError::Validation(
                    "either decks or deckIds is required".to_string(),
                ));
            }
        };
        if decks.len() != DECKS_PER_JOB {
            return Err(CoreError::Validation(format!(
                "expected {DECKS_PER_JOB} decks, got {}",
                decks.len()
            )));
        }

        let job = self
            .store
            .create_job(CreateJobParams {
                decks,
                deck_ids: request.deck_ids,
                simulations: request.simulations,
                parallelism,
                idempotency_key: request.idempotency_key,
                created_by: request.created_by,
            })
            .await?;
        if job.status != JobStatus::Queued {
            // Idempotency-key hit on a job that already progressed.
            return Ok(job);
        }

        let count = container_count(job.simulations);
        self.store.initialize_simulations(&job.id, count).await?;
        let published = self.publish_pending_sims(&job.id).await?;
        info!(job_id = %job.id, containers = count, published, "job dispatched");

        self.progress
            .update_job_progress(
                &job.id,
                json!({ "status": job.status, "totalSimCount": count }),
            )
            .await;
        Ok(job)
    }

    /// Publish tasks for every sim still PENDING; safe to repeat because
    /// claims are guarded. Returns the number published.
    pub async fn publish_pending_sims(&self, job_id: &str) -> Result<usize, CoreError> {
        let sims = self.store.get_simulation_statuses(job_id).await?;
        let total_sims = sims.len() as u32;
        let pending: Vec<SimTask> = sims
            .into_iter()
            .filter(|sim| sim.state == SimState::Pending)
            .map(|sim| SimTask {
                job_id: job_id.to_string(),
                sim_id: sim.sim_id,
                sim_index: sim.index,
                total_sims,
            })
            .collect();
        let published = pending.len();
        let mut publishes = futures::stream::iter(pending.into_iter().map(|task| {
            let broker = self.broker.clone();
            async move { broker.publish(task).await }
        }))
        .buffer_unordered(PUBLISH_CONCURRENCY);
        while let Some(result) = publishes.next().await {
            result?;
        }
        Ok(published)
    }
}
