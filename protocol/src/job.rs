use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Lifecycle of a job. `Failed` is terminal-but-retryable: the only edge out
/// of it is the explicit retry back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Transition table. Conditional store writes enforce this; callers use
    /// it to classify rejections for the worker-facing endpoints.
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                target,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                target,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Failed => matches!(target, JobStatus::Queued),
            JobStatus::Completed | JobStatus::Cancelled => false,
        }
    }
}

/// Lifecycle of one simulation (one container's worth of games).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SimState {
    pub const fn as_str(self) -> &'static str {
        match self {
            SimState::Pending => "PENDING",
            SimState::Running => "RUNNING",
            SimState::Completed => "COMPLETED",
            SimState::Failed => "FAILED",
            SimState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SimState::Completed | SimState::Cancelled)
    }

    /// Terminal for accounting purposes: the sim will not run again unless
    /// recovery resets it.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            SimState::Completed | SimState::Cancelled | SimState::Failed
        )
    }

    pub fn can_transition_to(self, target: SimState) -> bool {
        match self {
            SimState::Pending => matches!(target, SimState::Running | SimState::Cancelled),
            SimState::Running => matches!(
                target,
                SimState::Completed | SimState::Failed | SimState::Cancelled
            ),
            SimState::Failed => matches!(target, SimState::Pending),
            SimState::Completed | SimState::Cancelled => false,
        }
    }
}

/// Why a guarded state write was rejected. Carried back to workers as an
/// HTTP 200 `{updated: false}` body; under at-least-once delivery these are
/// expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionRejectionReason {
    TerminalState,
    InvalidTransition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRejection {
    pub reason: TransitionRejectionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl TransitionRejection {
    pub fn for_sim(from: SimState, to: SimState) -> Self {
        let reason = if from.is_terminal() {
            TransitionRejectionReason::TerminalState
        } else {
            TransitionRejectionReason::InvalidTransition
        };
        Self {
            reason,
            from: Some(from.as_str().to_string()),
            to: Some(to.as_str().to_string()),
        }
    }

    pub fn for_job(from: JobStatus, to: JobStatus) -> Self {
        let reason = if from.is_terminal() {
            TransitionRejectionReason::TerminalState
        } else {
            TransitionRejectionReason::InvalidTransition
        };
        Self {
            reason,
            from: Some(from.as_str().to_string()),
            to: Some(to.as_str().to_string()),
        }
    }
}

/// One deck at the table: display name plus the raw deck list the container
/// consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckDescriptor {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub decks: Vec<DeckDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deck_ids: Option<Vec<String>>,
    /// Requested game count, not container count.
    pub simulations: u32,
    pub parallelism: u32,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    pub retry_count: u32,
    pub completed_sim_count: u32,
    pub total_sim_count: u32,
    pub needs_aggregation: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker_run_durations_ms: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulation {
    pub job_id: String,
    pub sim_id: String,
    pub index: u32,
    pub state: SimState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub winners: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub winning_turns: Vec<u32>,
    /// Legacy singular fields kept on the wire for older observers; always
    /// mirror the first entry of the plural arrays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning_turn: Option<u32>,
}

/// `sim_000`-style child id for a 0-based container index.
pub fn sim_id_for_index(index: u32) -> String {
    format!("sim_{index:03}")
}

/// Inputs to `Store::create_job`. Validation of the numeric bounds happens
/// before the store is touched.
#[derive(Debug, Clone)]
pub struct CreateJobParams {
    pub decks: Vec<DeckDescriptor>,
    pub deck_ids: Option<Vec<String>>,
    pub simulations: u32,
    pub parallelism: u32,
    pub idempotency_key: Option<String>,
    pub created_by: String,
}

/// Partial update applied alongside a guarded job-status flip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub error_message: Option<String>,
}

/// Partial update for one simulation row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationPatch {
    pub state: Option<SimState>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub winners: Option<Vec<String>>,
    pub winning_turns: Option<Vec<u32>>,
}

impl SimulationPatch {
    /// Fold the legacy singular fields of a worker update into the plural
    /// arrays, which are what the store persists.
    pub fn merge_legacy(mut self, winner: Option<String>, winning_turn: Option<u32>) -> Self {
        if self.winners.is_none()
            && let Some(winner) = winner
        {
            self.winners = Some(vec![winner]);
        }
        if self.winning_turns.is_none()
            && let Some(turn) = winning_turn
        {
            self.winning_turns = Some(vec![turn]);
        }
        self
    }
}
