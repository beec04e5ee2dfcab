use super::SqliteStore;
use crate::model::JobRow;
use crate::model::SimCountProgress;
use crate::model::datetime_to_epoch_ms;
use chrono::Utc;
use podsim_protocol::CreateJobParams;
use podsim_protocol::Job;
use podsim_protocol::JobPatch;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::container_count;
use serde_json::Value;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id,
    created_at,
    created_by,
    decks_json,
    deck_ids_json,
    simulations,
    parallelism,
    status,
    idempotency_key,
    started_at,
    completed_at,
    claimed_at,
    worker_id,
    worker_name,
    retry_count,
    completed_sim_count,
    total_sim_count,
    needs_aggregation,
    docker_run_durations_json,
    error_message,
    results_json
"#;

impl SqliteStore {
    pub(super) async fn create_job_impl(&self, params: CreateJobParams) -> anyhow::Result<Job> {
        let now = datetime_to_epoch_ms(Utc::now());
        let id = Uuid::new_v4().to_string();
        let decks_json = serde_json::to_string(&params.decks)?;
        let deck_ids_json = params
            .deck_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let total_sim_count = i64::from(container_count(params.simulations));

        let mut tx = self.pool().begin().await?;
        if let Some(key) = params.idempotency_key.as_deref() {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT job_id FROM idempotency_keys WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(job_id) = existing {
                tx.rollback().await?;
                return self
                    .get_job_impl(&job_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("idempotency key maps to missing job {job_id}"));
            }
        }

        sqlx::query(
            r#"
INSERT INTO jobs (
    id, created_at, created_by, decks_json, deck_ids_json, simulations,
    parallelism, status, idempotency_key, started_at, completed_at,
    claimed_at, worker_id, worker_name, retry_count, completed_sim_count,
    total_sim_count, needs_aggregation, docker_run_durations_json,
    error_message, results_json
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, NULL, 0, 0, ?, 0, '[]', NULL, NULL)
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .bind(params.created_by.as_str())
        .bind(decks_json)
        .bind(deck_ids_json)
        .bind(i64::from(params.simulations))
        .bind(i64::from(params.parallelism))
        .bind(JobStatus::Queued.as_str())
        .bind(params.idempotency_key.as_deref())
        .bind(total_sim_count)
        .execute(&mut *tx)
        .await?;

        if let Some(key) = params.idempotency_key.as_deref() {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO idempotency_keys (key, job_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                // A concurrent create won the key; abandon our row and
                // return theirs.
                tx.rollback().await?;
                let job_id: String =
                    sqlx::query_scalar("SELECT job_id FROM idempotency_keys WHERE key = ?")
                        .bind(key)
                        .fetch_one(self.pool())
                        .await?;
                return self
                    .get_job_impl(&job_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("idempotency key maps to missing job {job_id}"));
            }
        }
        tx.commit().await?;

        self.get_job_impl(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created job {id}"))
    }

    pub(super) async fn get_job_impl(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Job::try_from).transpose()
    }

    pub(super) async fn list_jobs_impl(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
        if let Some(user_id) = user_id {
            builder.push(" WHERE created_by = ");
            builder.push_bind(user_id);
        }
        builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        builder.push_bind(limit as i64);
        let rows: Vec<JobRow> = builder
            .build_query_as::<JobRow>()
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    pub(super) async fn list_active_jobs_impl(&self) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN (?, ?) ORDER BY created_at ASC, id ASC"
        ))
        .bind(JobStatus::Queued.as_str())
        .bind(JobStatus::Running.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    pub(super) async fn update_job_status_impl(
        &self,
        id: &str,
        status: JobStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(super) async fn set_job_started_at_impl(
        &self,
        id: &str,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = datetime_to_epoch_ms(Utc::now());
        sqlx::query(
            r#"
UPDATE jobs
SET
    started_at = COALESCE(started_at, ?),
    claimed_at = COALESCE(claimed_at, ?),
    worker_id = COALESCE(?, worker_id),
    worker_name = COALESCE(?, worker_name)
WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(worker_id)
        .bind(worker_name)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn set_job_completed_impl(
        &self,
        id: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()> {
        let now = datetime_to_epoch_ms(Utc::now());
        let durations_json = docker_run_durations_ms
            .map(|durations| serde_json::to_string(&durations))
            .transpose()?;
        sqlx::query(
            r#"
UPDATE jobs
SET
    status = ?,
    completed_at = COALESCE(completed_at, ?),
    needs_aggregation = 0,
    docker_run_durations_json = COALESCE(?, docker_run_durations_json),
    error_message = NULL
WHERE id = ?
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(now)
        .bind(durations_json)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn set_job_failed_impl(
        &self,
        id: &str,
        message: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()> {
        let now = datetime_to_epoch_ms(Utc::now());
        let durations_json = docker_run_durations_ms
            .map(|durations| serde_json::to_string(&durations))
            .transpose()?;
        sqlx::query(
            r#"
UPDATE jobs
SET
    status = ?,
    completed_at = ?,
    error_message = ?,
    docker_run_durations_json = COALESCE(?, docker_run_durations_json)
WHERE id = ?
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(now)
        .bind(message)
        .bind(durations_json)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn set_job_results_impl(&self, id: &str, results: Value) -> anyhow::Result<()> {
        let results_json = serde_json::to_string(&results)?;
        sqlx::query("UPDATE jobs SET results_json = ? WHERE id = ?")
            .bind(results_json)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(super) async fn conditional_update_job_status_impl(
        &self,
        id: &str,
        expected: &[JobStatus],
        target: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE jobs SET status = ");
        builder.push_bind(target.as_str());
        if let Some(started_at) = patch.started_at {
            builder.push(", started_at = ");
            builder.push_bind(datetime_to_epoch_ms(started_at));
        }
        if let Some(completed_at) = patch.completed_at {
            builder.push(", completed_at = ");
            builder.push_bind(datetime_to_epoch_ms(completed_at));
        }
        if let Some(claimed_at) = patch.claimed_at {
            builder.push(", claimed_at = ");
            builder.push_bind(datetime_to_epoch_ms(claimed_at));
        }
        if let Some(worker_id) = patch.worker_id {
            builder.push(", worker_id = ");
            builder.push_bind(worker_id);
        }
        if let Some(worker_name) = patch.worker_name {
            builder.push(", worker_name = ");
            builder.push_bind(worker_name);
        }
        if let Some(error_message) = patch.error_message {
            builder.push(", error_message = ");
            builder.push_bind(error_message);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in expected {
            separated.push_bind(status.as_str());
        }
        builder.push(")");
        let result = builder.build().execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn cancel_job_impl(&self, id: &str) -> anyhow::Result<bool> {
        let now = datetime_to_epoch_ms(Utc::now());
        let mut tx = self.pool().begin().await?;
        let job_updated = sqlx::query(
            r#"
UPDATE jobs
SET status = ?, completed_at = ?
WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(now)
        .bind(id)
        .bind(JobStatus::Queued.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&mut *tx)
        .await?;
        if job_updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
UPDATE simulations
SET state = ?, completed_at = ?
WHERE job_id = ? AND state IN (?, ?)
            "#,
        )
        .bind(SimState::Cancelled.as_str())
        .bind(now)
        .bind(id)
        .bind(SimState::Pending.as_str())
        .bind(SimState::Running.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub(super) async fn delete_job_impl(&self, id: &str) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM simulations WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM idempotency_keys WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn claim_next_job_impl(
        &self,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<Option<Job>> {
        // Optimistic claim loop: read the head of the queue, then take it
        // with a guarded update. A lost race just means another claimant got
        // the row first, so try the next head.
        loop {
            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .bind(JobStatus::Queued.as_str())
            .fetch_optional(self.pool())
            .await?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            let now = datetime_to_epoch_ms(Utc::now());
            let claimed = sqlx::query(
                r#"
UPDATE jobs
SET status = ?, claimed_at = ?, started_at = COALESCE(started_at, ?),
    worker_id = ?, worker_name = ?
WHERE id = ? AND status = ?
                "#,
            )
            .bind(JobStatus::Running.as_str())
            .bind(now)
            .bind(now)
            .bind(worker_id)
            .bind(worker_name)
            .bind(id.as_str())
            .bind(JobStatus::Queued.as_str())
            .execute(self.pool())
            .await?;
            if claimed.rows_affected() > 0 {
                return self.get_job_impl(&id).await;
            }
        }
    }

    pub(super) async fn increment_completed_sim_count_impl(
        &self,
        job_id: &str,
    ) -> anyhow::Result<SimCountProgress> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE jobs SET completed_sim_count = completed_sim_count + 1 WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let row =
            sqlx::query("SELECT completed_sim_count, total_sim_count FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        let completed: i64 = row.try_get("completed_sim_count")?;
        let total: i64 = row.try_get("total_sim_count")?;
        Ok(SimCountProgress {
            completed_sim_count: u32::try_from(completed)?,
            total_sim_count: u32::try_from(total)?,
        })
    }

    pub(super) async fn set_needs_aggregation_impl(
        &self,
        job_id: &str,
        value: bool,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET needs_aggregation = ? WHERE id = ?")
            .bind(i64::from(value))
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(super) async fn reset_job_for_retry_impl(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET
    status = ?,
    started_at = NULL,
    completed_at = NULL,
    claimed_at = NULL,
    worker_id = NULL,
    worker_name = NULL,
    error_message = NULL,
    completed_sim_count = 0,
    docker_run_durations_json = '[]',
    retry_count = retry_count + 1
WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Queued.as_str())
        .bind(id)
        .bind(JobStatus::Failed.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
