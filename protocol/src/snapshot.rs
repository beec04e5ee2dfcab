use crate::GAMES_PER_CONTAINER;
use crate::Job;
use crate::SimState;
use crate::Simulation;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Aggregate view of the worker pool attached to job snapshots so observers
/// can tell "queued because no workers" from "queued behind other jobs".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolSummary {
    pub active_workers: u32,
    pub total_capacity: u32,
    pub busy_simulations: u32,
}

/// Stable projection of a job row emitted on the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub name: String,
    pub deck_names: Vec<String>,
    pub status: crate::JobStatus,
    pub simulations: u32,
    pub games_completed: u32,
    pub parallelism: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pool: Option<WorkerPoolSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deck_links: Vec<String>,
}

impl JobSnapshot {
    /// Project a job row (plus its sims, when available) into the stream
    /// shape. `games_completed` is authoritatively `K x #COMPLETED sims`;
    /// the stored counter is only a fallback when sims were not readable.
    pub fn project(job: &Job, sims: Option<&[Simulation]>) -> Self {
        let games_completed = match sims {
            Some(sims) => {
                let completed = sims
                    .iter()
                    .filter(|sim| sim.state == SimState::Completed)
                    .count() as u32;
                (completed * GAMES_PER_CONTAINER).min(job.simulations)
            }
            None => (job.completed_sim_count * GAMES_PER_CONTAINER).min(job.simulations),
        };
        let duration_ms = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => u64::try_from(
                end.signed_duration_since(start)
                    .num_milliseconds()
                    .max(0),
            )
            .ok(),
            _ => None,
        };
        let deck_names: Vec<String> = job.decks.iter().map(|deck| deck.name.clone()).collect();
        let name = if deck_names.is_empty() {
            job.id.clone()
        } else {
            deck_names.join(" vs ")
        };
        Self {
            id: job.id.clone(),
            name,
            deck_names,
            status: job.status,
            simulations: job.simulations,
            games_completed,
            parallelism: job.parallelism,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms,
            worker_id: job.worker_id.clone(),
            worker_name: job.worker_name.clone(),
            retry_count: job.retry_count,
            error_message: job.error_message.clone(),
            results: job.results.clone(),
            queue_position: None,
            worker_pool: None,
            deck_links: Vec::new(),
        }
    }
}

/// Named `simulations` SSE event payload: the full ordered row list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationsEvent {
    pub simulations: Vec<Simulation>,
}

/// One emission on the progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Job(Box<JobSnapshot>),
    Simulations(SimulationsEvent),
}
