use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Liveness thresholds: a worker is considered active while its last
/// heartbeat is within this window. Updating workers get a longer grace
/// period because an image pull can outlast the normal interval.
pub const HEARTBEAT_ACTIVE_WINDOW_SECS: i64 = 60;
pub const HEARTBEAT_UPDATING_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Updating,
}

impl WorkerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Updating => "updating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "updating" => Some(Self::Updating),
            _ => None,
        }
    }
}

/// Heartbeat record for one worker. Upserts merge: fields a worker never
/// writes (`max_concurrent_override`, `owner_email`) survive each beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_id: String,
    pub worker_name: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
    pub capacity: u32,
    pub active_simulations: u32,
    pub uptime_ms: u64,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_override: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
}

impl WorkerInfo {
    /// Whether this record counts as an active worker at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let window = match self.status {
            WorkerStatus::Updating => HEARTBEAT_UPDATING_WINDOW_SECS,
            _ => HEARTBEAT_ACTIVE_WINDOW_SECS,
        };
        now.signed_duration_since(self.last_heartbeat).num_seconds() <= window
    }
}
