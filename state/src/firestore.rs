use crate::model::SimCountProgress;
use crate::store::Store;
use async_trait::async_trait;
use podsim_protocol::CreateJobParams;
use podsim_protocol::DeckRating;
use podsim_protocol::Job;
use podsim_protocol::JobPatch;
use podsim_protocol::JobStatus;
use podsim_protocol::MatchResult;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use podsim_protocol::SimulationPatch;
use podsim_protocol::WorkerInfo;
use serde_json::Value;
use std::sync::Arc;

mod client;
mod codec;
mod ops;

pub use client::FirestoreClient;

pub(crate) const JOBS: &str = "jobs";
pub(crate) const SIMULATIONS: &str = "simulations";
pub(crate) const WORKER_HEARTBEATS: &str = "workerHeartbeats";
pub(crate) const IDEMPOTENCY_KEYS: &str = "idempotencyKeys";
pub(crate) const RATINGS: &str = "ratings";
pub(crate) const MATCH_RESULTS: &str = "matchResults";

/// Bearer-token source for the REST calls. Production deployments plug in
/// a metadata-server or service-account provider; the emulator needs none.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> anyhow::Result<Option<String>> {
        Ok(self.token.clone())
    }
}

#[derive(Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub base_url: String,
    pub token_provider: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for FirestoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreConfig")
            .field("project_id", &self.project_id)
            .field("database", &self.database)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FirestoreConfig {
    /// Defaults to the public endpoint; `FIRESTORE_EMULATOR_HOST` redirects
    /// everything to a local emulator with auth disabled.
    pub fn new(project_id: impl Into<String>) -> Self {
        let base_url = match std::env::var("FIRESTORE_EMULATOR_HOST") {
            Ok(host) if !host.is_empty() => format!("http://{host}/v1"),
            _ => "https://firestore.googleapis.com/v1".to_string(),
        };
        Self {
            project_id: project_id.into(),
            database: "(default)".to_string(),
            base_url,
            token_provider: Arc::new(StaticTokenProvider::default()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = provider;
        self
    }
}

/// Document-DB store backend over the Firestore REST API. Hierarchy:
/// `jobs/{id}` with subcollection `jobs/{id}/simulations/{simId}`; flat
/// collections for heartbeats, idempotency keys, ratings, match results.
///
/// Conditional writes run as transactional read-modify-write
/// (`beginTransaction` + `commit`), the native primitive for "atomic
/// against concurrent writers" here. Contended transactions are retried a
/// few times; a guard mismatch rolls back and reports `false`.
#[derive(Clone)]
pub struct FirestoreStore {
    client: FirestoreClient,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: FirestoreClient::new(config)?,
        })
    }

    pub(crate) fn client(&self) -> &FirestoreClient {
        &self.client
    }
}

#[async_trait]
impl Store for FirestoreStore {
    async fn create_job(&self, params: CreateJobParams) -> anyhow::Result<Job> {
        self.create_job_impl(params).await
    }

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        self.get_job_impl(id).await
    }

    async fn list_jobs(&self, user_id: Option<&str>, limit: usize) -> anyhow::Result<Vec<Job>> {
        self.list_jobs_impl(user_id, limit).await
    }

    async fn list_active_jobs(&self) -> anyhow::Result<Vec<Job>> {
        self.list_active_jobs_impl().await
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> anyhow::Result<()> {
        self.update_job_status_impl(id, status).await
    }

    async fn set_job_started_at(
        &self,
        id: &str,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<()> {
        self.set_job_started_at_impl(id, worker_id, worker_name)
            .await
    }

    async fn set_job_completed(
        &self,
        id: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()> {
        self.set_job_completed_impl(id, docker_run_durations_ms)
            .await
    }

    async fn set_job_failed(
        &self,
        id: &str,
        message: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()> {
        self.set_job_failed_impl(id, message, docker_run_durations_ms)
            .await
    }

    async fn set_job_results(&self, id: &str, results: Value) -> anyhow::Result<()> {
        self.set_job_results_impl(id, results).await
    }

    async fn conditional_update_job_status(
        &self,
        id: &str,
        expected: &[JobStatus],
        target: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<bool> {
        self.conditional_update_job_status_impl(id, expected, target, patch)
            .await
    }

    async fn cancel_job(&self, id: &str) -> anyhow::Result<bool> {
        self.cancel_job_impl(id).await
    }

    async fn delete_job(&self, id: &str) -> anyhow::Result<()> {
        self.delete_job_impl(id).await
    }

    async fn delete_simulations(&self, job_id: &str) -> anyhow::Result<()> {
        self.delete_simulations_impl(job_id).await
    }

    async fn claim_next_job(
        &self,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<Option<Job>> {
        self.claim_next_job_impl(worker_id, worker_name).await
    }

    async fn initialize_simulations(&self, job_id: &str, count: u32) -> anyhow::Result<()> {
        self.initialize_simulations_impl(job_id, count).await
    }

    async fn update_simulation_status(
        &self,
        job_id: &str,
        sim_id: &str,
        patch: SimulationPatch,
    ) -> anyhow::Result<()> {
        self.update_simulation_status_impl(job_id, sim_id, patch)
            .await
    }

    async fn conditional_update_simulation_status(
        &self,
        job_id: &str,
        sim_id: &str,
        expected: &[SimState],
        patch: SimulationPatch,
    ) -> anyhow::Result<bool> {
        self.conditional_update_simulation_status_impl(job_id, sim_id, expected, patch)
            .await
    }

    async fn increment_completed_sim_count(
        &self,
        job_id: &str,
    ) -> anyhow::Result<SimCountProgress> {
        self.increment_completed_sim_count_impl(job_id).await
    }

    async fn set_needs_aggregation(&self, job_id: &str, value: bool) -> anyhow::Result<()> {
        self.set_needs_aggregation_impl(job_id, value).await
    }

    async fn reset_job_for_retry(&self, id: &str) -> anyhow::Result<bool> {
        self.reset_job_for_retry_impl(id).await
    }

    async fn get_simulation_status(
        &self,
        job_id: &str,
        sim_id: &str,
    ) -> anyhow::Result<Option<Simulation>> {
        self.get_simulation_status_impl(job_id, sim_id).await
    }

    async fn get_simulation_statuses(&self, job_id: &str) -> anyhow::Result<Vec<Simulation>> {
        self.get_simulation_statuses_impl(job_id).await
    }

    async fn upsert_worker_heartbeat(&self, info: WorkerInfo) -> anyhow::Result<()> {
        self.upsert_worker_heartbeat_impl(info).await
    }

    async fn list_active_workers(&self) -> anyhow::Result<Vec<WorkerInfo>> {
        self.list_active_workers_impl().await
    }

    async fn get_worker(&self, worker_id: &str) -> anyhow::Result<Option<WorkerInfo>> {
        self.get_worker_impl(worker_id).await
    }

    async fn get_deck_ratings(&self, deck_ids: &[String]) -> anyhow::Result<Vec<DeckRating>> {
        self.get_deck_ratings_impl(deck_ids).await
    }

    async fn upsert_deck_ratings(&self, ratings: &[DeckRating]) -> anyhow::Result<()> {
        self.upsert_deck_ratings_impl(ratings).await
    }

    async fn insert_match_results(&self, results: &[MatchResult]) -> anyhow::Result<bool> {
        self.insert_match_results_impl(results).await
    }

    async fn has_match_results(&self, job_id: &str) -> anyhow::Result<bool> {
        self.has_match_results_impl(job_id).await
    }
}
