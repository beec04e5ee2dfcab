use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Per-deck TrueSkill distribution. Display rating is `mu - 3 * sigma`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckRating {
    pub deck_id: String,
    pub mu: f64,
    pub sigma: f64,
    pub games_played: u32,
    pub wins: u32,
    pub last_updated: DateTime<Utc>,
}

impl DeckRating {
    pub fn display_rating(&self) -> f64 {
        self.mu - 3.0 * self.sigma
    }
}

/// One finished game. The primary key `{jobId}_{gameIndex}` makes rating
/// updates idempotent at the job level: if any row for the job exists, the
/// whole update is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub id: String,
    pub job_id: String,
    pub game_index: u32,
    pub deck_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_deck_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_count: Option<u32>,
    pub played_at: DateTime<Utc>,
}

pub fn match_result_id(job_id: &str, game_index: u32) -> String {
    format!("{job_id}_{game_index}")
}
