use super::FirestoreStore;
use super::IDEMPOTENCY_KEYS;
use super::JOBS;
use super::MATCH_RESULTS;
use super::RATINGS;
use super::SIMULATIONS;
use super::WORKER_HEARTBEATS;
use super::codec;
use crate::model::SimCountProgress;
use chrono::Utc;
use podsim_protocol::CreateJobParams;
use podsim_protocol::DeckRating;
use podsim_protocol::Job;
use podsim_protocol::JobPatch;
use podsim_protocol::JobStatus;
use podsim_protocol::MatchResult;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use podsim_protocol::SimulationPatch;
use podsim_protocol::WorkerInfo;
use podsim_protocol::container_count;
use podsim_protocol::sim_id_for_index;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

/// Transactional read-modify-write attempts before reporting contention as
/// an infrastructure error.
const TXN_ATTEMPTS: usize = 3;

fn job_path(id: &str) -> String {
    format!("{JOBS}/{id}")
}

fn sim_path(job_id: &str, sim_id: &str) -> String {
    format!("{JOBS}/{job_id}/{SIMULATIONS}/{sim_id}")
}

fn status_in_filter(statuses: &[&str]) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": "status" },
            "op": "IN",
            "value": {
                "arrayValue": {
                    "values": statuses
                        .iter()
                        .map(|status| codec::str_value(*status))
                        .collect::<Vec<_>>()
                }
            }
        }
    })
}

impl FirestoreStore {
    pub(super) async fn create_job_impl(&self, params: CreateJobParams) -> anyhow::Result<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            created_by: params.created_by,
            decks: params.decks,
            deck_ids: params.deck_ids,
            simulations: params.simulations,
            parallelism: params.parallelism,
            status: JobStatus::Queued,
            idempotency_key: params.idempotency_key.clone(),
            started_at: None,
            completed_at: None,
            claimed_at: None,
            worker_id: None,
            worker_name: None,
            retry_count: 0,
            completed_sim_count: 0,
            total_sim_count: container_count(params.simulations),
            needs_aggregation: false,
            docker_run_durations_ms: Vec::new(),
            error_message: None,
            results: None,
        };
        let job_write = self.client().update_write(
            &job_path(&job.id),
            codec::job_to_fields(&job),
            None,
            Some(false),
        );

        let Some(key) = params.idempotency_key else {
            if !self.client().commit(vec![job_write], None).await? {
                anyhow::bail!("job id collision for {}", job.id);
            }
            return Ok(job);
        };

        let key_path = format!("{IDEMPOTENCY_KEYS}/{key}");
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            if let Some(existing) = self.client().get_document(&key_path, Some(txn.as_str())).await? {
                self.client().rollback(&txn).await?;
                let job_id = codec::get_str(&existing.fields, "jobId")
                    .ok_or_else(|| anyhow::anyhow!("idempotency key {key} missing jobId"))?;
                return self.get_job_impl(&job_id).await?.ok_or_else(|| {
                    anyhow::anyhow!("idempotency key {key} maps to missing job {job_id}")
                });
            }
            let key_write = self.client().update_write(
                &key_path,
                json!({
                    "jobId": codec::str_value(job.id.clone()),
                    "createdAt": codec::ts_value(job.created_at),
                }),
                None,
                Some(false),
            );
            if self
                .client()
                .commit(vec![job_write.clone(), key_write], Some(txn.as_str()))
                .await?
            {
                return Ok(job);
            }
            // Lost the key race; the next read returns the winner.
        }
        anyhow::bail!("persistent contention creating job with idempotency key {key}")
    }

    pub(super) async fn get_job_impl(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let doc = self.client().get_document(&job_path(id), None).await?;
        doc.map(|doc| codec::fields_to_job(&doc.fields)).transpose()
    }

    pub(super) async fn list_jobs_impl(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<Job>> {
        let mut query = json!({
            "from": [{ "collectionId": JOBS }],
            "orderBy": [{ "field": { "fieldPath": "createdAt" }, "direction": "DESCENDING" }],
            "limit": limit,
        });
        if let Some(user_id) = user_id {
            query["where"] = json!({
                "fieldFilter": {
                    "field": { "fieldPath": "createdBy" },
                    "op": "EQUAL",
                    "value": codec::str_value(user_id),
                }
            });
        }
        let docs = self.client().run_query(None, query, None).await?;
        docs.iter()
            .map(|doc| codec::fields_to_job(&doc.fields))
            .collect()
    }

    pub(super) async fn list_active_jobs_impl(&self) -> anyhow::Result<Vec<Job>> {
        let query = json!({
            "from": [{ "collectionId": JOBS }],
            "where": status_in_filter(&[JobStatus::Queued.as_str(), JobStatus::Running.as_str()]),
            "orderBy": [{ "field": { "fieldPath": "createdAt" }, "direction": "ASCENDING" }],
        });
        let docs = self.client().run_query(None, query, None).await?;
        docs.iter()
            .map(|doc| codec::fields_to_job(&doc.fields))
            .collect()
    }

    pub(super) async fn update_job_status_impl(
        &self,
        id: &str,
        status: JobStatus,
    ) -> anyhow::Result<()> {
        let write = self.client().update_write(
            &job_path(id),
            json!({ "status": codec::str_value(status.as_str()) }),
            Some(vec!["status".into()]),
            Some(true),
        );
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn set_job_started_at_impl(
        &self,
        id: &str,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<()> {
        // COALESCE semantics need the current document.
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self.client().get_document(&job_path(id), Some(txn.as_str())).await? else {
                self.client().rollback(&txn).await?;
                return Ok(());
            };
            let job = codec::fields_to_job(&doc.fields)?;
            let now = Utc::now();
            let mut fields = serde_json::Map::new();
            let mut mask = Vec::new();
            if job.started_at.is_none() {
                fields.insert("startedAt".into(), codec::ts_value(now));
                mask.push("startedAt".to_string());
            }
            if job.claimed_at.is_none() {
                fields.insert("claimedAt".into(), codec::ts_value(now));
                mask.push("claimedAt".to_string());
            }
            if let Some(worker_id) = worker_id {
                fields.insert("workerId".into(), codec::str_value(worker_id));
                mask.push("workerId".to_string());
            }
            if let Some(worker_name) = worker_name {
                fields.insert("workerName".into(), codec::str_value(worker_name));
                mask.push("workerName".to_string());
            }
            if mask.is_empty() {
                self.client().rollback(&txn).await?;
                return Ok(());
            }
            let write = self.client().update_write(
                &job_path(id),
                Value::Object(fields),
                Some(mask),
                Some(true),
            );
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                return Ok(());
            }
        }
        anyhow::bail!("persistent contention setting startedAt on job {id}")
    }

    pub(super) async fn set_job_completed_impl(
        &self,
        id: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()> {
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self.client().get_document(&job_path(id), Some(txn.as_str())).await? else {
                self.client().rollback(&txn).await?;
                return Ok(());
            };
            let job = codec::fields_to_job(&doc.fields)?;
            let mut fields = serde_json::Map::new();
            let mut mask = vec![
                "status".to_string(),
                "needsAggregation".to_string(),
                "errorMessage".to_string(),
            ];
            fields.insert(
                "status".into(),
                codec::str_value(JobStatus::Completed.as_str()),
            );
            fields.insert("needsAggregation".into(), codec::bool_value(false));
            // errorMessage is masked but absent: deleted.
            if job.completed_at.is_none() {
                fields.insert("completedAt".into(), codec::ts_value(Utc::now()));
                mask.push("completedAt".to_string());
            }
            if let Some(durations) = &docker_run_durations_ms {
                fields.insert(
                    "dockerRunDurationsMs".into(),
                    codec::array_value(
                        durations.iter().map(|ms| codec::int_value(*ms as i64)).collect(),
                    ),
                );
                mask.push("dockerRunDurationsMs".to_string());
            }
            let write = self.client().update_write(
                &job_path(id),
                Value::Object(fields),
                Some(mask),
                Some(true),
            );
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                return Ok(());
            }
        }
        anyhow::bail!("persistent contention completing job {id}")
    }

    pub(super) async fn set_job_failed_impl(
        &self,
        id: &str,
        message: &str,
        docker_run_durations_ms: Option<Vec<u64>>,
    ) -> anyhow::Result<()> {
        let mut fields = serde_json::Map::new();
        let mut mask = vec![
            "status".to_string(),
            "completedAt".to_string(),
            "errorMessage".to_string(),
        ];
        fields.insert("status".into(), codec::str_value(JobStatus::Failed.as_str()));
        fields.insert("completedAt".into(), codec::ts_value(Utc::now()));
        fields.insert("errorMessage".into(), codec::str_value(message));
        if let Some(durations) = &docker_run_durations_ms {
            fields.insert(
                "dockerRunDurationsMs".into(),
                codec::array_value(
                    durations.iter().map(|ms| codec::int_value(*ms as i64)).collect(),
                ),
            );
            mask.push("dockerRunDurationsMs".to_string());
        }
        let write = self.client().update_write(
            &job_path(id),
            Value::Object(fields),
            Some(mask),
            Some(true),
        );
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn set_job_results_impl(&self, id: &str, results: Value) -> anyhow::Result<()> {
        let write = self.client().update_write(
            &job_path(id),
            json!({ "results": codec::json_to_value(&results) }),
            Some(vec!["results".into()]),
            Some(true),
        );
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn conditional_update_job_status_impl(
        &self,
        id: &str,
        expected: &[JobStatus],
        target: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<bool> {
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self.client().get_document(&job_path(id), Some(txn.as_str())).await? else {
                self.client().rollback(&txn).await?;
                return Ok(false);
            };
            let job = codec::fields_to_job(&doc.fields)?;
            if !expected.contains(&job.status) {
                self.client().rollback(&txn).await?;
                return Ok(false);
            }
            let (fields, mask) = codec::job_patch_to_fields(target, &patch);
            let write =
                self.client()
                    .update_write(&job_path(id), fields, Some(mask), Some(true));
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                return Ok(true);
            }
        }
        anyhow::bail!("persistent contention on conditional job update {id}")
    }

    pub(super) async fn cancel_job_impl(&self, id: &str) -> anyhow::Result<bool> {
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self.client().get_document(&job_path(id), Some(txn.as_str())).await? else {
                self.client().rollback(&txn).await?;
                return Ok(false);
            };
            let job = codec::fields_to_job(&doc.fields)?;
            if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                self.client().rollback(&txn).await?;
                return Ok(false);
            }
            let sims = self.read_simulations(id, Some(txn.as_str())).await?;
            let now = Utc::now();
            let mut writes = vec![self.client().update_write(
                &job_path(id),
                json!({
                    "status": codec::str_value(JobStatus::Cancelled.as_str()),
                    "completedAt": codec::ts_value(now),
                }),
                Some(vec!["status".into(), "completedAt".into()]),
                Some(true),
            )];
            for sim in sims {
                if matches!(sim.state, SimState::Pending | SimState::Running) {
                    writes.push(self.client().update_write(
                        &sim_path(id, &sim.sim_id),
                        json!({
                            "state": codec::str_value(SimState::Cancelled.as_str()),
                            "completedAt": codec::ts_value(now),
                        }),
                        Some(vec!["state".into(), "completedAt".into()]),
                        Some(true),
                    ));
                }
            }
            if self.client().commit(writes, Some(txn.as_str())).await? {
                return Ok(true);
            }
        }
        anyhow::bail!("persistent contention cancelling job {id}")
    }

    pub(super) async fn delete_job_impl(&self, id: &str) -> anyhow::Result<()> {
        let job = self.get_job_impl(id).await?;
        self.delete_simulations_impl(id).await?;
        if let Some(job) = &job
            && let Some(key) = &job.idempotency_key
        {
            self.client()
                .delete_document(&format!("{IDEMPOTENCY_KEYS}/{key}"))
                .await?;
        }
        self.client().delete_document(&job_path(id)).await?;
        Ok(())
    }

    pub(super) async fn delete_simulations_impl(&self, job_id: &str) -> anyhow::Result<()> {
        let sims = self.read_simulations(job_id, None).await?;
        if sims.is_empty() {
            return Ok(());
        }
        let writes = sims
            .iter()
            .map(|sim| self.client().delete_write(&sim_path(job_id, &sim.sim_id)))
            .collect();
        self.client().commit(writes, None).await?;
        Ok(())
    }

    pub(super) async fn claim_next_job_impl(
        &self,
        worker_id: Option<&str>,
        worker_name: Option<&str>,
    ) -> anyhow::Result<Option<Job>> {
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let query = json!({
                "from": [{ "collectionId": JOBS }],
                "where": status_in_filter(&[JobStatus::Queued.as_str()]),
                "orderBy": [{ "field": { "fieldPath": "createdAt" }, "direction": "ASCENDING" }],
                "limit": 1,
            });
            let docs = self.client().run_query(None, query, Some(txn.as_str())).await?;
            let Some(doc) = docs.first() else {
                self.client().rollback(&txn).await?;
                return Ok(None);
            };
            let mut job = codec::fields_to_job(&doc.fields)?;
            let now = Utc::now();
            let mut fields = serde_json::Map::new();
            let mut mask = vec!["status".to_string(), "claimedAt".to_string()];
            fields.insert(
                "status".into(),
                codec::str_value(JobStatus::Running.as_str()),
            );
            fields.insert("claimedAt".into(), codec::ts_value(now));
            if job.started_at.is_none() {
                fields.insert("startedAt".into(), codec::ts_value(now));
                mask.push("startedAt".to_string());
                job.started_at = Some(now);
            }
            if let Some(worker_id) = worker_id {
                fields.insert("workerId".into(), codec::str_value(worker_id));
                mask.push("workerId".to_string());
                job.worker_id = Some(worker_id.to_string());
            }
            if let Some(worker_name) = worker_name {
                fields.insert("workerName".into(), codec::str_value(worker_name));
                mask.push("workerName".to_string());
                job.worker_name = Some(worker_name.to_string());
            }
            let write = self.client().update_write(
                &job_path(&job.id),
                Value::Object(fields),
                Some(mask),
                Some(true),
            );
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                job.status = JobStatus::Running;
                job.claimed_at = Some(now);
                return Ok(Some(job));
            }
        }
        anyhow::bail!("persistent contention claiming next job")
    }

    pub(super) async fn initialize_simulations_impl(
        &self,
        job_id: &str,
        count: u32,
    ) -> anyhow::Result<()> {
        for index in 0..count {
            let sim_id = sim_id_for_index(index);
            let fields = json!({
                "jobId": codec::str_value(job_id),
                "simId": codec::str_value(sim_id.clone()),
                "index": codec::int_value(i64::from(index)),
                "state": codec::str_value(SimState::Pending.as_str()),
                "winners": codec::array_value(Vec::new()),
                "winningTurns": codec::array_value(Vec::new()),
            });
            let write =
                self.client()
                    .update_write(&sim_path(job_id, &sim_id), fields, None, Some(false));
            // An existing row loses the precondition and stays untouched.
            self.client().commit(vec![write], None).await?;
        }
        let write = self.client().update_write(
            &job_path(job_id),
            json!({ "totalSimCount": codec::int_value(i64::from(count)) }),
            Some(vec!["totalSimCount".into()]),
            Some(true),
        );
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn update_simulation_status_impl(
        &self,
        job_id: &str,
        sim_id: &str,
        patch: SimulationPatch,
    ) -> anyhow::Result<()> {
        let (fields, mask) = codec::simulation_patch_to_fields(&patch);
        if mask.is_empty() {
            return Ok(());
        }
        let write = self.client().update_write(
            &sim_path(job_id, sim_id),
            fields,
            Some(mask),
            Some(true),
        );
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn conditional_update_simulation_status_impl(
        &self,
        job_id: &str,
        sim_id: &str,
        expected: &[SimState],
        patch: SimulationPatch,
    ) -> anyhow::Result<bool> {
        let path = sim_path(job_id, sim_id);
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self.client().get_document(&path, Some(txn.as_str())).await? else {
                self.client().rollback(&txn).await?;
                return Ok(false);
            };
            let sim = codec::fields_to_simulation(&doc.fields)?;
            if !expected.contains(&sim.state) {
                self.client().rollback(&txn).await?;
                return Ok(false);
            }
            let (fields, mask) = codec::simulation_patch_to_fields(&patch);
            let write = self
                .client()
                .update_write(&path, fields, Some(mask), Some(true));
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                return Ok(true);
            }
        }
        anyhow::bail!("persistent contention on conditional sim update {path}")
    }

    pub(super) async fn increment_completed_sim_count_impl(
        &self,
        job_id: &str,
    ) -> anyhow::Result<SimCountProgress> {
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self
                .client()
                .get_document(&job_path(job_id), Some(txn.as_str()))
                .await?
            else {
                self.client().rollback(&txn).await?;
                anyhow::bail!("job {job_id} not found");
            };
            let job = codec::fields_to_job(&doc.fields)?;
            let completed = job.completed_sim_count + 1;
            let write = self.client().update_write(
                &job_path(job_id),
                json!({ "completedSimCount": codec::int_value(i64::from(completed)) }),
                Some(vec!["completedSimCount".into()]),
                Some(true),
            );
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                return Ok(SimCountProgress {
                    completed_sim_count: completed,
                    total_sim_count: job.total_sim_count,
                });
            }
        }
        anyhow::bail!("persistent contention incrementing counter for job {job_id}")
    }

    pub(super) async fn set_needs_aggregation_impl(
        &self,
        job_id: &str,
        value: bool,
    ) -> anyhow::Result<()> {
        let write = self.client().update_write(
            &job_path(job_id),
            json!({ "needsAggregation": codec::bool_value(value) }),
            Some(vec!["needsAggregation".into()]),
            Some(true),
        );
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn reset_job_for_retry_impl(&self, id: &str) -> anyhow::Result<bool> {
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            let Some(doc) = self.client().get_document(&job_path(id), Some(txn.as_str())).await? else {
                self.client().rollback(&txn).await?;
                return Ok(false);
            };
            let job = codec::fields_to_job(&doc.fields)?;
            if job.status != JobStatus::Failed {
                self.client().rollback(&txn).await?;
                return Ok(false);
            }
            // Fields in the mask but absent from the payload are deleted.
            let fields = json!({
                "status": codec::str_value(JobStatus::Queued.as_str()),
                "completedSimCount": codec::int_value(0),
                "dockerRunDurationsMs": codec::array_value(Vec::new()),
                "retryCount": codec::int_value(i64::from(job.retry_count + 1)),
            });
            let mask = vec![
                "status".to_string(),
                "completedSimCount".to_string(),
                "dockerRunDurationsMs".to_string(),
                "retryCount".to_string(),
                "startedAt".to_string(),
                "completedAt".to_string(),
                "claimedAt".to_string(),
                "workerId".to_string(),
                "workerName".to_string(),
                "errorMessage".to_string(),
            ];
            let write = self
                .client()
                .update_write(&job_path(id), fields, Some(mask), Some(true));
            if self.client().commit(vec![write], Some(txn.as_str())).await? {
                return Ok(true);
            }
        }
        anyhow::bail!("persistent contention resetting job {id}")
    }

    pub(super) async fn get_simulation_status_impl(
        &self,
        job_id: &str,
        sim_id: &str,
    ) -> anyhow::Result<Option<Simulation>> {
        let doc = self
            .client()
            .get_document(&sim_path(job_id, sim_id), None)
            .await?;
        doc.map(|doc| codec::fields_to_simulation(&doc.fields))
            .transpose()
    }

    pub(super) async fn get_simulation_statuses_impl(
        &self,
        job_id: &str,
    ) -> anyhow::Result<Vec<Simulation>> {
        self.read_simulations(job_id, None).await
    }

    async fn read_simulations(
        &self,
        job_id: &str,
        transaction: Option<&str>,
    ) -> anyhow::Result<Vec<Simulation>> {
        let query = json!({
            "from": [{ "collectionId": SIMULATIONS }],
            "orderBy": [{ "field": { "fieldPath": "index" }, "direction": "ASCENDING" }],
        });
        let docs = self
            .client()
            .run_query(Some(job_path(job_id).as_str()), query, transaction)
            .await?;
        docs.iter()
            .map(|doc| codec::fields_to_simulation(&doc.fields))
            .collect()
    }

    pub(super) async fn upsert_worker_heartbeat_impl(
        &self,
        info: WorkerInfo,
    ) -> anyhow::Result<()> {
        let (fields, mask) = codec::worker_to_fields(&info);
        let path = format!("{WORKER_HEARTBEATS}/{}", info.worker_id);
        // Masked update without a precondition is a merge-upsert: operator
        // fields outside the mask survive.
        let write = self.client().update_write(&path, fields, Some(mask), None);
        self.client().commit(vec![write], None).await?;
        Ok(())
    }

    pub(super) async fn list_active_workers_impl(&self) -> anyhow::Result<Vec<WorkerInfo>> {
        let query = json!({
            "from": [{ "collectionId": WORKER_HEARTBEATS }],
        });
        let docs = self.client().run_query(None, query, None).await?;
        let now = Utc::now();
        let mut workers = Vec::new();
        for doc in &docs {
            let worker = codec::fields_to_worker(&doc.fields)?;
            if worker.is_active_at(now) {
                workers.push(worker);
            }
        }
        workers.sort_by(|a, b| a.worker_name.cmp(&b.worker_name));
        Ok(workers)
    }

    pub(super) async fn get_worker_impl(
        &self,
        worker_id: &str,
    ) -> anyhow::Result<Option<WorkerInfo>> {
        let doc = self
            .client()
            .get_document(&format!("{WORKER_HEARTBEATS}/{worker_id}"), None)
            .await?;
        doc.map(|doc| codec::fields_to_worker(&doc.fields))
            .transpose()
    }

    pub(super) async fn get_deck_ratings_impl(
        &self,
        deck_ids: &[String],
    ) -> anyhow::Result<Vec<DeckRating>> {
        let mut ratings = Vec::new();
        for deck_id in deck_ids {
            if let Some(doc) = self
                .client()
                .get_document(&format!("{RATINGS}/{deck_id}"), None)
                .await?
            {
                ratings.push(codec::fields_to_rating(&doc.fields)?);
            }
        }
        Ok(ratings)
    }

    pub(super) async fn upsert_deck_ratings_impl(
        &self,
        ratings: &[DeckRating],
    ) -> anyhow::Result<()> {
        if ratings.is_empty() {
            return Ok(());
        }
        let writes = ratings
            .iter()
            .map(|rating| {
                self.client().update_write(
                    &format!("{RATINGS}/{}", rating.deck_id),
                    codec::rating_to_fields(rating),
                    None,
                    None,
                )
            })
            .collect();
        self.client().commit(writes, None).await?;
        Ok(())
    }

    pub(super) async fn insert_match_results_impl(
        &self,
        results: &[MatchResult],
    ) -> anyhow::Result<bool> {
        let Some(first) = results.first() else {
            return Ok(false);
        };
        for _ in 0..TXN_ATTEMPTS {
            let txn = self.client().begin_transaction().await?;
            if self
                .query_match_results(&first.job_id, Some(txn.as_str()))
                .await?
                .is_some()
            {
                self.client().rollback(&txn).await?;
                return Ok(false);
            }
            let writes = results
                .iter()
                .map(|result| {
                    self.client().update_write(
                        &format!("{MATCH_RESULTS}/{}", result.id),
                        codec::match_result_to_fields(result),
                        None,
                        Some(false),
                    )
                })
                .collect();
            if self.client().commit(writes, Some(txn.as_str())).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(super) async fn has_match_results_impl(&self, job_id: &str) -> anyhow::Result<bool> {
        Ok(self.query_match_results(job_id, None).await?.is_some())
    }

    async fn query_match_results(
        &self,
        job_id: &str,
        transaction: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let query = json!({
            "from": [{ "collectionId": MATCH_RESULTS }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": "jobId" },
                    "op": "EQUAL",
                    "value": codec::str_value(job_id),
                }
            },
            "limit": 1,
        });
        let docs = self.client().run_query(None, query, transaction).await?;
        Ok(docs.first().map(|doc| doc.path.clone()))
    }
}
