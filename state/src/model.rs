use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use podsim_protocol::DeckDescriptor;
use podsim_protocol::Job;
use podsim_protocol::JobStatus;
use podsim_protocol::MatchResult;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use podsim_protocol::WorkerInfo;
use podsim_protocol::WorkerStatus;
use serde::Deserialize;
use serde::Serialize;

/// Post-increment counter pair returned by
/// `Store::increment_completed_sim_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimCountProgress {
    pub completed_sim_count: u32,
    pub total_sim_count: u32,
}

impl SimCountProgress {
    pub fn all_done(self) -> bool {
        self.total_sim_count > 0 && self.completed_sim_count >= self.total_sim_count
    }
}

pub(crate) fn epoch_ms_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| anyhow::anyhow!("invalid unix timestamp (ms): {ms}"))
}

pub(crate) fn datetime_to_epoch_ms(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub(crate) id: String,
    pub(crate) created_at: i64,
    pub(crate) created_by: String,
    pub(crate) decks_json: String,
    pub(crate) deck_ids_json: Option<String>,
    pub(crate) simulations: i64,
    pub(crate) parallelism: i64,
    pub(crate) status: String,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) started_at: Option<i64>,
    pub(crate) completed_at: Option<i64>,
    pub(crate) claimed_at: Option<i64>,
    pub(crate) worker_id: Option<String>,
    pub(crate) worker_name: Option<String>,
    pub(crate) retry_count: i64,
    pub(crate) completed_sim_count: i64,
    pub(crate) total_sim_count: i64,
    pub(crate) needs_aggregation: i64,
    pub(crate) docker_run_durations_json: String,
    pub(crate) error_message: Option<String>,
    pub(crate) results_json: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let decks: Vec<DeckDescriptor> = serde_json::from_str(row.decks_json.as_str())?;
        let deck_ids = row
            .deck_ids_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let docker_run_durations_ms =
            serde_json::from_str(row.docker_run_durations_json.as_str())?;
        let results = row
            .results_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let status = JobStatus::parse(row.status.as_str())
            .ok_or_else(|| anyhow::anyhow!("invalid job status: {}", row.status))?;
        Ok(Self {
            id: row.id,
            created_at: epoch_ms_to_datetime(row.created_at)?,
            created_by: row.created_by,
            decks,
            deck_ids,
            simulations: u32::try_from(row.simulations)?,
            parallelism: u32::try_from(row.parallelism)?,
            status,
            idempotency_key: row.idempotency_key,
            started_at: row.started_at.map(epoch_ms_to_datetime).transpose()?,
            completed_at: row.completed_at.map(epoch_ms_to_datetime).transpose()?,
            claimed_at: row.claimed_at.map(epoch_ms_to_datetime).transpose()?,
            worker_id: row.worker_id,
            worker_name: row.worker_name,
            retry_count: u32::try_from(row.retry_count)?,
            completed_sim_count: u32::try_from(row.completed_sim_count)?,
            total_sim_count: u32::try_from(row.total_sim_count)?,
            needs_aggregation: row.needs_aggregation != 0,
            docker_run_durations_ms,
            error_message: row.error_message,
            results,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SimulationRow {
    pub(crate) job_id: String,
    pub(crate) sim_id: String,
    pub(crate) sim_index: i64,
    pub(crate) state: String,
    pub(crate) worker_id: Option<String>,
    pub(crate) worker_name: Option<String>,
    pub(crate) started_at: Option<i64>,
    pub(crate) completed_at: Option<i64>,
    pub(crate) duration_ms: Option<i64>,
    pub(crate) error_message: Option<String>,
    pub(crate) winners_json: String,
    pub(crate) winning_turns_json: String,
}

impl TryFrom<SimulationRow> for Simulation {
    type Error = anyhow::Error;

    fn try_from(row: SimulationRow) -> Result<Self> {
        let state = SimState::parse(row.state.as_str())
            .ok_or_else(|| anyhow::anyhow!("invalid simulation state: {}", row.state))?;
        let winners: Vec<String> = serde_json::from_str(row.winners_json.as_str())?;
        let winning_turns: Vec<u32> = serde_json::from_str(row.winning_turns_json.as_str())?;
        Ok(Self {
            job_id: row.job_id,
            sim_id: row.sim_id,
            index: u32::try_from(row.sim_index)?,
            state,
            worker_id: row.worker_id,
            worker_name: row.worker_name,
            started_at: row.started_at.map(epoch_ms_to_datetime).transpose()?,
            completed_at: row.completed_at.map(epoch_ms_to_datetime).transpose()?,
            duration_ms: row.duration_ms.map(u64::try_from).transpose()?,
            error_message: row.error_message,
            winner: winners.first().cloned(),
            winning_turn: winning_turns.first().copied(),
            winners,
            winning_turns,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkerRow {
    pub(crate) worker_id: String,
    pub(crate) worker_name: String,
    pub(crate) status: String,
    pub(crate) current_job_id: Option<String>,
    pub(crate) capacity: i64,
    pub(crate) active_simulations: i64,
    pub(crate) uptime_ms: i64,
    pub(crate) last_heartbeat: i64,
    pub(crate) version: Option<String>,
    pub(crate) max_concurrent_override: Option<i64>,
    pub(crate) owner_email: Option<String>,
}

impl TryFrom<WorkerRow> for WorkerInfo {
    type Error = anyhow::Error;

    fn try_from(row: WorkerRow) -> Result<Self> {
        let status = WorkerStatus::parse(row.status.as_str())
            .ok_or_else(|| anyhow::anyhow!("invalid worker status: {}", row.status))?;
        Ok(Self {
            worker_id: row.worker_id,
            worker_name: row.worker_name,
            status,
            current_job_id: row.current_job_id,
            capacity: u32::try_from(row.capacity)?,
            active_simulations: u32::try_from(row.active_simulations)?,
            uptime_ms: u64::try_from(row.uptime_ms)?,
            last_heartbeat: epoch_ms_to_datetime(row.last_heartbeat)?,
            version: row.version,
            max_concurrent_override: row.max_concurrent_override.map(u32::try_from).transpose()?,
            owner_email: row.owner_email,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MatchResultRow {
    pub(crate) id: String,
    pub(crate) job_id: String,
    pub(crate) game_index: i64,
    pub(crate) deck_ids_json: String,
    pub(crate) winner_deck_id: Option<String>,
    pub(crate) turn_count: Option<i64>,
    pub(crate) played_at: i64,
}

impl TryFrom<MatchResultRow> for MatchResult {
    type Error = anyhow::Error;

    fn try_from(row: MatchResultRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            game_index: u32::try_from(row.game_index)?,
            deck_ids: serde_json::from_str(row.deck_ids_json.as_str())?,
            winner_deck_id: row.winner_deck_id,
            turn_count: row.turn_count.map(u32::try_from).transpose()?,
            played_at: epoch_ms_to_datetime(row.played_at)?,
        })
    }
}
