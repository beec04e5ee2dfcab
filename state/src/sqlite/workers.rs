use super::SqliteStore;
use crate::model::WorkerRow;
use crate::model::datetime_to_epoch_ms;
use chrono::Utc;
use podsim_protocol::HEARTBEAT_ACTIVE_WINDOW_SECS;
use podsim_protocol::HEARTBEAT_UPDATING_WINDOW_SECS;
use podsim_protocol::WorkerInfo;
use podsim_protocol::WorkerStatus;

const WORKER_COLUMNS: &str = r#"
    worker_id,
    worker_name,
    status,
    current_job_id,
    capacity,
    active_simulations,
    uptime_ms,
    last_heartbeat,
    version,
    max_concurrent_override,
    owner_email
"#;

impl SqliteStore {
    pub(super) async fn upsert_worker_heartbeat_impl(
        &self,
        info: WorkerInfo,
    ) -> anyhow::Result<()> {
        // Merge semantics: operator-set fields (max_concurrent_override,
        // owner_email) are only overwritten when the beat carries them.
        sqlx::query(
            r#"
INSERT INTO worker_heartbeats (
    worker_id, worker_name, status, current_job_id, capacity,
    active_simulations, uptime_ms, last_heartbeat, version,
    max_concurrent_override, owner_email
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(worker_id) DO UPDATE SET
    worker_name = excluded.worker_name,
    status = excluded.status,
    current_job_id = excluded.current_job_id,
    capacity = excluded.capacity,
    active_simulations = excluded.active_simulations,
    uptime_ms = excluded.uptime_ms,
    last_heartbeat = excluded.last_heartbeat,
    version = COALESCE(excluded.version, worker_heartbeats.version),
    max_concurrent_override = COALESCE(excluded.max_concurrent_override, worker_heartbeats.max_concurrent_override),
    owner_email = COALESCE(excluded.owner_email, worker_heartbeats.owner_email)
            "#,
        )
        .bind(info.worker_id.as_str())
        .bind(info.worker_name.as_str())
        .bind(info.status.as_str())
        .bind(info.current_job_id.as_deref())
        .bind(i64::from(info.capacity))
        .bind(i64::from(info.active_simulations))
        .bind(i64::try_from(info.uptime_ms)?)
        .bind(datetime_to_epoch_ms(info.last_heartbeat))
        .bind(info.version.as_deref())
        .bind(info.max_concurrent_override.map(i64::from))
        .bind(info.owner_email.as_deref())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn list_active_workers_impl(&self) -> anyhow::Result<Vec<WorkerInfo>> {
        let now = Utc::now();
        let active_cutoff =
            datetime_to_epoch_ms(now) - HEARTBEAT_ACTIVE_WINDOW_SECS * 1000;
        let updating_cutoff =
            datetime_to_epoch_ms(now) - HEARTBEAT_UPDATING_WINDOW_SECS * 1000;
        let rows = sqlx::query_as::<_, WorkerRow>(&format!(
            r#"
SELECT {WORKER_COLUMNS}
FROM worker_heartbeats
WHERE (status = ? AND last_heartbeat >= ?)
   OR (status != ? AND last_heartbeat >= ?)
ORDER BY worker_name ASC
            "#
        ))
        .bind(WorkerStatus::Updating.as_str())
        .bind(updating_cutoff)
        .bind(WorkerStatus::Updating.as_str())
        .bind(active_cutoff)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(WorkerInfo::try_from).collect()
    }

    pub(super) async fn get_worker_impl(
        &self,
        worker_id: &str,
    ) -> anyhow::Result<Option<WorkerInfo>> {
        let row = sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM worker_heartbeats WHERE worker_id = ?"
        ))
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(WorkerInfo::try_from).transpose()
    }
}
