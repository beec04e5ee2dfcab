use super::SqliteStore;
use crate::model::SimulationRow;
use crate::model::datetime_to_epoch_ms;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use podsim_protocol::SimulationPatch;
use podsim_protocol::sim_id_for_index;
use sqlx::QueryBuilder;
use sqlx::Sqlite;

const SIMULATION_COLUMNS: &str = r#"
    job_id,
    sim_id,
    sim_index,
    state,
    worker_id,
    worker_name,
    started_at,
    completed_at,
    duration_ms,
    error_message,
    winners_json,
    winning_turns_json
"#;

fn push_patch(builder: &mut QueryBuilder<'_, Sqlite>, patch: SimulationPatch) -> anyhow::Result<u32> {
    let mut fields = 0;
    let mut push_field = |builder: &mut QueryBuilder<'_, Sqlite>, fields: &mut u32, sql: &str| {
        if *fields > 0 {
            builder.push(", ");
        }
        builder.push(sql);
        *fields += 1;
    };
    if let Some(state) = patch.state {
        push_field(builder, &mut fields, "state = ");
        builder.push_bind(state.as_str());
    }
    if let Some(worker_id) = patch.worker_id {
        push_field(builder, &mut fields, "worker_id = ");
        builder.push_bind(worker_id);
    }
    if let Some(worker_name) = patch.worker_name {
        push_field(builder, &mut fields, "worker_name = ");
        builder.push_bind(worker_name);
    }
    if let Some(started_at) = patch.started_at {
        push_field(builder, &mut fields, "started_at = ");
        builder.push_bind(datetime_to_epoch_ms(started_at));
    }
    if let Some(completed_at) = patch.completed_at {
        push_field(builder, &mut fields, "completed_at = ");
        builder.push_bind(datetime_to_epoch_ms(completed_at));
    }
    if let Some(duration_ms) = patch.duration_ms {
        push_field(builder, &mut fields, "duration_ms = ");
        builder.push_bind(i64::try_from(duration_ms)?);
    }
    if let Some(error_message) = patch.error_message {
        push_field(builder, &mut fields, "error_message = ");
        builder.push_bind(error_message);
    }
    if let Some(winners) = patch.winners {
        push_field(builder, &mut fields, "winners_json = ");
        builder.push_bind(serde_json::to_string(&winners)?);
    }
    if let Some(winning_turns) = patch.winning_turns {
        push_field(builder, &mut fields, "winning_turns_json = ");
        builder.push_bind(serde_json::to_string(&winning_turns)?);
    }
    Ok(fields)
}

impl SqliteStore {
    pub(super) async fn initialize_simulations_impl(
        &self,
        job_id: &str,
        count: u32,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        for index in 0..count {
            sqlx::query(
                r#"
INSERT OR IGNORE INTO simulations (job_id, sim_id, sim_index, state)
VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(job_id)
            .bind(sim_id_for_index(index))
            .bind(i64::from(index))
            .bind(SimState::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE jobs SET total_sim_count = ? WHERE id = ?")
            .bind(i64::from(count))
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn update_simulation_status_impl(
        &self,
        job_id: &str,
        sim_id: &str,
        patch: SimulationPatch,
    ) -> anyhow::Result<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE simulations SET ");
        if push_patch(&mut builder, patch)? == 0 {
            return Ok(());
        }
        builder.push(" WHERE job_id = ");
        builder.push_bind(job_id);
        builder.push(" AND sim_id = ");
        builder.push_bind(sim_id);
        builder.build().execute(self.pool()).await?;
        Ok(())
    }

    pub(super) async fn conditional_update_simulation_status_impl(
        &self,
        job_id: &str,
        sim_id: &str,
        expected: &[SimState],
        patch: SimulationPatch,
    ) -> anyhow::Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE simulations SET ");
        if push_patch(&mut builder, patch)? == 0 {
            return Ok(false);
        }
        builder.push(" WHERE job_id = ");
        builder.push_bind(job_id);
        builder.push(" AND sim_id = ");
        builder.push_bind(sim_id);
        builder.push(" AND state IN (");
        let mut separated = builder.separated(", ");
        for state in expected {
            separated.push_bind(state.as_str());
        }
        builder.push(")");
        let result = builder.build().execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn delete_simulations_impl(&self, job_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM simulations WHERE job_id = ?")
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(super) async fn get_simulation_status_impl(
        &self,
        job_id: &str,
        sim_id: &str,
    ) -> anyhow::Result<Option<Simulation>> {
        let row = sqlx::query_as::<_, SimulationRow>(&format!(
            "SELECT {SIMULATION_COLUMNS} FROM simulations WHERE job_id = ? AND sim_id = ?"
        ))
        .bind(job_id)
        .bind(sim_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(Simulation::try_from).transpose()
    }

    pub(super) async fn get_simulation_statuses_impl(
        &self,
        job_id: &str,
    ) -> anyhow::Result<Vec<Simulation>> {
        let rows = sqlx::query_as::<_, SimulationRow>(&format!(
            "SELECT {SIMULATION_COLUMNS} FROM simulations WHERE job_id = ? ORDER BY sim_index ASC"
        ))
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(Simulation::try_from).collect()
    }
}
