use podsim_protocol::DeckDescriptor;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::TransitionRejection;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobBody {
    #[serde(default)]
    pub deck_ids: Option<Vec<String>>,
    /// Inline decks for local use; production callers send `deckIds`.
    #[serde(default)]
    pub decks: Option<Vec<DeckDescriptor>>,
    pub simulations: u32,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobBody {
    pub status: JobStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
}

/// Worker-side simulation update. The legacy singular `winner` and
/// `winningTurn` fields are accepted and folded into the arrays.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSimulationBody {
    #[serde(default)]
    pub state: Option<SimState>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub winning_turn: Option<u32>,
    #[serde(default)]
    pub winners: Option<Vec<String>>,
    #[serde(default)]
    pub winning_turns: Option<Vec<u32>>,
}

/// `{updated: true}` on applied transitions; rejected ones carry the
/// reason and travel with HTTP 200 because redeliveries make them routine.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateOutcome {
    pub updated: bool,
    #[serde(flatten)]
    pub rejection: Option<TransitionRejection>,
}

impl UpdateOutcome {
    pub fn applied() -> Self {
        Self {
            updated: true,
            rejection: None,
        }
    }

    pub fn rejected(rejection: TransitionRejection) -> Self {
        Self {
            updated: false,
            rejection: Some(rejection),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResponse {
    pub sims_initialized: bool,
    pub tasks_republished: usize,
    pub sims_failed: usize,
    pub sims_reset: usize,
    pub aggregation_kicked: bool,
}
