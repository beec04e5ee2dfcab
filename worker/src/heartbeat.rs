use crate::runtime::WorkerState;
use chrono::Utc;
use podsim_protocol::WorkerInfo;
use podsim_state::Store;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_JITTER: Duration = Duration::from_secs(5);

pub fn beat_from_state(state: &WorkerState) -> WorkerInfo {
    WorkerInfo {
        worker_id: state.worker_id.clone(),
        worker_name: state.worker_name.clone(),
        status: state.status(),
        current_job_id: state.current_job(),
        capacity: state.capacity,
        active_simulations: state.active(),
        uptime_ms: state.uptime_ms(),
        last_heartbeat: Utc::now(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        max_concurrent_override: None,
        owner_email: None,
    }
}

/// Writes the worker's liveness row every 15s with up to 5s of jitter so a
/// fleet does not thundering-herd the store.
pub async fn heartbeat_loop(
    store: Arc<dyn Store>,
    state: Arc<WorkerState>,
    shutdown: CancellationToken,
) {
    loop {
        if let Err(err) = store.upsert_worker_heartbeat(beat_from_state(&state)).await {
            warn!(worker_id = %state.worker_id, "heartbeat write failed: {err:#}");
        }
        let jitter_ms = rand::rng().random_range(0..=HEARTBEAT_JITTER.as_millis() as u64);
        let sleep = HEARTBEAT_INTERVAL + Duration::from_millis(jitter_ms);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    // Final beat so the pool sees the worker go idle instead of vanishing.
    let mut beat = beat_from_state(&state);
    beat.status = podsim_protocol::WorkerStatus::Idle;
    beat.active_simulations = 0;
    beat.current_job_id = None;
    if let Err(err) = store.upsert_worker_heartbeat(beat).await {
        warn!(worker_id = %state.worker_id, "final heartbeat failed: {err:#}");
    }
}
