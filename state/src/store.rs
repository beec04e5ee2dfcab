use crate::model::SimCountProgress;
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

/// The store contract shared by every actor: control plane, workers, and
/// the recovery engine all mutate job and simulation rows exclusively
/// through these operations.
///
/// Infrastructure failures (IO, network) propagate unwrapped; callers own
/// retry policy. Conditional operations return `Ok(false)` when the guard
/// did not match; under at-least-once delivery that is the normal way a
/// duplicate loses a race.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new QUEUED job. When `idempotency_key` collides with an
    /// earlier create, the existing job is returned unchanged; the job row
    /// and the key row are inserted atomically.
    async fn create_job(&self, params: CreateJobParams) -> anyhow::Result<Job>;

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>>;

    /// Newest first, bounded by `limit`.
    async fn list_jobs(&self, user_id: Option<&str>, limit: usize) -> anyhow::Result<Vec<Job>>;

    /// Jobs with status QUEUED or RUNNING, oldest first.
    async fn list_active_jobs(&self) -> anyhow::Result<Vec<Job>>;

    async fn update_job_status(&self, id: &str, status: JobStatus) -> anyhow::Result<()>;

    async fn set_job_started_at(
        &self,
        id: &str,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn set_job_completed(
        &self,
        id: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()>;

    async fn set_job_failed(
        &self,
        id: &str,
        message: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()>;

    async fn set_job_results(&self, id: &str, results: Value) -> anyhow::Result<()>;

    /// Apply `target` and `patch` atomically iff the current status is in
    /// `expected`. This is what keeps the QUEUED -> RUNNING flip from being
    /// applied twice when many sims race.
    async fn conditional_update_job_status(
        &self,
        id: &str,
        expected: &[JobStatus],
        target: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<bool>;

    /// QUEUED or RUNNING only: flip the job to CANCELLED, stamp
    /// `completedAt`, and cascade PENDING/RUNNING sims to CANCELLED in the
    /// same transaction. Returns false (no rows changed) otherwise.
    async fn cancel_job(&self, id: &str) -> anyhow::Result<bool>;

    async fn delete_job(&self, id: &str) -> anyhow::Result<()>;

    async fn delete_simulations(&self, job_id: &str) -> anyhow::Result<()>;

    /// Polling mode (no broker): atomically claim the oldest QUEUED job,
    /// flipping it to RUNNING with the claimant's identity.
    async fn claim_next_job(
        &self,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<Option<Job>>;

    /// Batch-insert `sim_000..sim_{count-1}` in PENDING and pin the job's
    /// `totalSimCount`. Idempotent: rows that already exist are untouched.
    async fn initialize_simulations(&self, job_id: &str, count: u32) -> anyhow::Result<()>;

    async fn update_simulation_status(
        &self,
        job_id: &str,
        sim_id: &str,
        patch: SimulationPatch,
    ) -> anyhow::Result<()>;

    /// Apply `patch` atomically iff the current state is in `expected`.
    async fn conditional_update_simulation_status(
        &self,
        job_id: &str,
        sim_id: &str,
        expected: &[SimState],
        patch: SimulationPatch,
    ) -> anyhow::Result<bool>;

    /// Atomic counter bump; returns the post-increment pair.
    async fn increment_completed_sim_count(&self, job_id: &str)
    -> anyhow::Result<SimCountProgress>;

    async fn set_needs_aggregation(&self, job_id: &str, value: bool) -> anyhow::Result<()>;

    /// FAILED -> QUEUED retry edge: clears every runtime field, bumps
    /// `retryCount`. False when the job is not FAILED.
    async fn reset_job_for_retry(&self, id: &str) -> anyhow::Result<bool>;

    async fn get_simulation_status(
        &self,
        job_id: &str,
        sim_id: &str,
    ) -> anyhow::Result<Option<Simulation>>;

    /// All sims of a job, ordered by index.
    async fn get_simulation_statuses(&self, job_id: &str) -> anyhow::Result<Vec<Simulation>>;

    /// Merge-upsert: fields the worker never writes
    /// (`maxConcurrentOverride`, `ownerEmail`) survive each beat.
    async fn upsert_worker_heartbeat(&self, info: WorkerInfo) -> anyhow::Result<()>;

    /// Workers whose heartbeat is within the liveness window.
    async fn list_active_workers(&self) -> anyhow::Result<Vec<WorkerInfo>>;

    async fn get_worker(&self, worker_id: &str) -> anyhow::Result<Option<WorkerInfo>>;

    /// Ratings for the given decks; missing decks are simply absent.
    async fn get_deck_ratings(&self, deck_ids: &[String]) -> anyhow::Result<Vec<DeckRating>>;

    async fn upsert_deck_ratings(&self, ratings: &[DeckRating]) -> anyhow::Result<()>;

    /// All-or-nothing insert. Returns false without writing anything when a
    /// result for the same job already exists; this is the job-level
    /// idempotency guard for rating updates.
    async fn insert_match_results(&self, results: &[MatchResult]) -> anyhow::Result<bool>;

    async fn has_match_results(&self, job_id: &str) -> anyhow::Result<bool>;
}
