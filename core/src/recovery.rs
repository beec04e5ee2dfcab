use crate::aggregator::Aggregator;
use crate::dispatcher::Dispatcher;
use chrono::Utc;
use podsim_protocol::Job;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::SimulationPatch;
use podsim_protocol::container_count;
use podsim_state::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryThresholds {
    /// A QUEUED job older than this gets its tasks (re-)published.
    pub queued_stuck: Duration,
    /// A PENDING sim in a RUNNING job older than this is re-published.
    pub pending_stuck: Duration,
    /// A RUNNING sim older than this is failed as hung.
    pub running_stuck: Duration,
    /// Minimum gap between republish actions for one job.
    pub republish_cooldown: Duration,
}

impl Default for RecoveryThresholds {
    fn default() -> Self {
        Self {
            queued_stuck: Duration::from_secs(120),
            pending_stuck: Duration::from_secs(5 * 60),
            running_stuck: Duration::from_secs(150 * 60),
            republish_cooldown: Duration::from_secs(120),
        }
    }
}

/// What one recovery pass over a job actually did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub sims_initialized: bool,
    pub tasks_republished: usize,
    pub sims_failed: usize,
    pub sims_reset: usize,
    pub aggregation_kicked: bool,
}

impl RecoveryReport {
    pub fn acted(&self) -> bool {
        self.sims_initialized
            || self.tasks_republished > 0
            || self.sims_failed > 0
            || self.sims_reset > 0
    }
}

/// Re-drives work the happy path lost: crashed dispatchers, dropped
/// messages, dead workers, hung containers. Runs as a periodic loop over
/// the active jobs plus one-shot kicks from the stream endpoint.
///
/// The per-job republish cooldown map is the engine's only mutable
/// process-local state and lives here, never in a global.
pub struct RecoveryEngine {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<Aggregator>,
    thresholds: RecoveryThresholds,
    last_republish: Mutex<HashMap<String, Instant>>,
}

impl RecoveryEngine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        aggregator: Arc<Aggregator>,
        thresholds: RecoveryThresholds,
    ) -> Self {
        Self {
            store,
            dispatcher,
            aggregator,
            thresholds,
            last_republish: Mutex::new(HashMap::new()),
        }
    }

    /// One pass over every active job. Infrastructure errors are logged
    /// and swallowed; the next tick retries.
    pub async fn run_pass(&self) {
        let jobs = match self.store.list_active_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!("recovery pass could not list active jobs: {err:#}");
                return;
            }
        };
        let active_workers = match self.store.list_active_workers().await {
            Ok(workers) => workers.len(),
            Err(err) => {
                warn!("recovery pass could not list workers: {err:#}");
                return;
            }
        };
        for job in jobs {
            if let Err(err) = self.recover(&job, active_workers).await {
                warn!(job_id = %job.id, "recovery failed for job: {err:#}");
            }
        }
    }

    /// One-shot kick for a single job (stream open, `/recover` endpoint).
    pub async fn recover_job(&self, job_id: &str) -> anyhow::Result<RecoveryReport> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(RecoveryReport::default());
        };
        if !job.status.is_active() {
            return Ok(RecoveryReport::default());
        }
        let active_workers = self.store.list_active_workers().await?.len();
        self.recover(&job, active_workers).await
    }

    async fn recover(&self, job: &Job, active_workers: usize) -> anyhow::Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        if job.status == JobStatus::Queued {
            let age = now.signed_duration_since(job.created_at).to_std().unwrap_or_default();
            if age >= self.thresholds.queued_stuck && active_workers > 0 {
                if self.cooldown_elapsed(&job.id) {
                    // A dispatcher that crashed between createJob and
                    // initializeSimulations leaves no child rows at all.
                    let sims = self.store.get_simulation_statuses(&job.id).await?;
                    if sims.is_empty() {
                        let count = container_count(job.simulations);
                        self.store.initialize_simulations(&job.id, count).await?;
                        report.sims_initialized = true;
                        info!(job_id = %job.id, count, "recovery initialized missing sims");
                    }
                    report.tasks_republished =
                        self.dispatcher.publish_pending_sims(&job.id).await.map_err(
                            |err| anyhow::anyhow!("republish failed: {err}"),
                        )?;
                    self.touch_cooldown(&job.id);
                    info!(
                        job_id = %job.id,
                        republished = report.tasks_republished,
                        "recovery re-drove stuck QUEUED job"
                    );
                }
            }
            return Ok(report);
        }

        // RUNNING job: examine each sim.
        let sims = self.store.get_simulation_statuses(&job.id).await?;
        let job_started = job.started_at.unwrap_or(job.created_at);
        let mut want_republish = false;

        for sim in &sims {
            match sim.state {
                SimState::Pending => {
                    let age = now
                        .signed_duration_since(job_started)
                        .to_std()
                        .unwrap_or_default();
                    if age >= self.thresholds.pending_stuck {
                        want_republish = true;
                    }
                }
                SimState::Running => {
                    let started = sim.started_at.unwrap_or(job_started);
                    let age = now.signed_duration_since(started).to_std().unwrap_or_default();
                    let orphaned = !self
                        .worker_is_active(sim.worker_id.as_deref())
                        .await
                        .unwrap_or(true);
                    if age >= self.thresholds.running_stuck {
                        if self
                            .fail_sim(&job.id, &sim.sim_id, "Simulation timed out waiting for the container")
                            .await?
                        {
                            report.sims_failed += 1;
                        }
                    } else if orphaned {
                        if self
                            .fail_sim(&job.id, &sim.sim_id, "Worker lost connection")
                            .await?
                        {
                            report.sims_failed += 1;
                        }
                    }
                }
                SimState::Failed => {
                    if active_workers > 0 {
                        let reset = self
                            .store
                            .conditional_update_simulation_status(
                                &job.id,
                                &sim.sim_id,
                                &[SimState::Failed, SimState::Pending],
                                SimulationPatch {
                                    state: Some(SimState::Pending),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        if reset {
                            report.sims_reset += 1;
                            want_republish = true;
                        }
                    }
                }
                SimState::Completed | SimState::Cancelled => {}
            }
        }

        if want_republish && self.cooldown_elapsed(&job.id) {
            report.tasks_republished = self
                .dispatcher
                .publish_pending_sims(&job.id)
                .await
                .map_err(|err| anyhow::anyhow!("republish failed: {err}"))?;
            if report.tasks_republished > 0 {
                self.touch_cooldown(&job.id);
                info!(
                    job_id = %job.id,
                    republished = report.tasks_republished,
                    "recovery republished pending sims"
                );
            }
        }

        if !report.acted()
            && !sims.is_empty()
            && sims
                .iter()
                .all(|sim| matches!(sim.state, SimState::Completed | SimState::Cancelled))
        {
            report.aggregation_kicked = true;
            self.aggregator.aggregate(&job.id).await?;
        }

        Ok(report)
    }

    async fn worker_is_active(&self, worker_id: Option<&str>) -> anyhow::Result<bool> {
        let Some(worker_id) = worker_id else {
            // No claimant recorded; leave it to the hung-container timeout.
            return Ok(true);
        };
        let Some(worker) = self.store.get_worker(worker_id).await? else {
            return Ok(false);
        };
        Ok(worker.is_active_at(Utc::now()))
    }

    async fn fail_sim(&self, job_id: &str, sim_id: &str, message: &str) -> anyhow::Result<bool> {
        let updated = self
            .store
            .conditional_update_simulation_status(
                job_id,
                sim_id,
                &[SimState::Running],
                SimulationPatch {
                    state: Some(SimState::Failed),
                    error_message: Some(message.to_string()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        if updated {
            info!(job_id, sim_id, message, "recovery failed stuck sim");
        }
        Ok(updated)
    }

    fn cooldown_elapsed(&self, job_id: &str) -> bool {
        let cooldowns = self.lock_cooldowns();
        match cooldowns.get(job_id) {
            Some(last) => last.elapsed() >= self.thresholds.republish_cooldown,
            None => true,
        }
    }

    fn touch_cooldown(&self, job_id: &str) {
        self.lock_cooldowns().insert(job_id.to_string(), Instant::now());
    }

    fn lock_cooldowns(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        match self.last_republish.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Background loop; ~45s between passes.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_pass().await;
            }
        })
    }
}
