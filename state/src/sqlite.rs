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
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

mod jobs;
mod ratings;
mod simulations;
#[cfg(test)]
mod test_support;
mod workers;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub const SQLITE_DB_FILENAME: &str = "podsim.sqlite";

pub fn sqlite_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SQLITE_DB_FILENAME)
}

/// Embedded store backend over a single SQLite file in WAL mode.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and migrate) the database under `data_dir`, creating the
    /// directory and file as needed.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Self::open(&sqlite_db_path(&data_dir)).await
    }

    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
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
