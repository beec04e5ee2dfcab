use crate::cancel::CancellationRegistry;
use crate::container::ContainerRuntime;
use crate::container::EXIT_CANCELLED;
use crate::container::RunOutcome;
use crate::container::RunRequest;
use crate::heartbeat::heartbeat_loop;
use crate::parse::GameLogParser;
use chrono::Utc;
use futures::StreamExt;
use podsim_broker::Delivery;
use podsim_broker::SimTask;
use podsim_broker::TaskBroker;
use podsim_core::Aggregator;
use podsim_core::BlobStore;
use podsim_core::Config;
use podsim_core::ProgressChannel;
use podsim_core::raw_log_path;
use podsim_protocol::DECKS_PER_JOB;
use podsim_protocol::JobPatch;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::SimulationPatch;
use podsim_protocol::WorkerStatus;
use podsim_protocol::container_count;
use podsim_state::Store;
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// How often the worker re-checks tracked jobs for user cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long shutdown waits for in-flight containers before aborting them.
const DRAIN_DEADLINE: Duration = Duration::from_secs(60);
/// Pause between claim attempts in polling (no-broker) mode.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Mutable worker-local state shared between the task loop and the
/// heartbeat emitter.
pub struct WorkerState {
    pub worker_id: String,
    pub worker_name: String,
    pub capacity: u32,
    active: AtomicU32,
    current_job: Mutex<Option<String>>,
    started: Instant,
}

impl WorkerState {
    pub fn new(worker_id: String, worker_name: String, capacity: u32) -> Self {
        Self {
            worker_id,
            worker_name,
            capacity,
            active: AtomicU32::new(0),
            current_job: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        if self.active() > 0 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn current_job(&self) -> Option<String> {
        self.lock_current().clone()
    }

    fn task_started(&self, job_id: &str) {
        self.active.fetch_add(1, Ordering::SeqCst);
        *self.lock_current() = Some(job_id.to_string());
    }

    fn task_finished(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            *self.lock_current() = None;
        }
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.current_job.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Long-lived worker: pulls tasks up to its capacity, claims each sim with
/// a guarded write, runs the container, reports the terminal transition,
/// uploads the raw log, and heartbeats. Every store write a redelivered
/// message could repeat is conditional, so duplicates fall out as
/// `updated == false` and are acked.
pub struct WorkerRuntime {
    store: Arc<dyn Store>,
    broker: Arc<dyn TaskBroker>,
    blob: Arc<dyn BlobStore>,
    aggregator: Arc<Aggregator>,
    containers: Arc<dyn ContainerRuntime>,
    parser: Arc<dyn GameLogParser>,
    progress: Arc<dyn ProgressChannel>,
    config: Arc<Config>,
    state: Arc<WorkerState>,
    cancellations: Arc<CancellationRegistry>,
    slots: Arc<Semaphore>,
}

impl WorkerRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn TaskBroker>,
        blob: Arc<dyn BlobStore>,
        aggregator: Arc<Aggregator>,
        containers: Arc<dyn ContainerRuntime>,
        parser: Arc<dyn GameLogParser>,
        progress: Arc<dyn ProgressChannel>,
        config: Arc<Config>,
        state: Arc<WorkerState>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(state.capacity as usize));
        Self {
            store,
            broker,
            blob,
            aggregator,
            containers,
            parser,
            progress,
            config,
            state,
            cancellations: Arc::new(CancellationRegistry::new()),
            slots,
        }
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Broker-driven main loop. Prefetch equals free capacity: a slot is
    /// taken before pulling, so the broker never surfaces more work than
    /// `capacity - active`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        if let Err(err) = self.containers.prune_orphans().await {
            warn!("startup container prune failed: {err:#}");
        }
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.state.clone(),
            shutdown.clone(),
        ));
        let watcher = tokio::spawn(self.clone().watch_cancellations(shutdown.clone()));

        info!(
            worker_id = %self.state.worker_id,
            capacity = self.state.capacity,
            "worker subscribed"
        );
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    drop(permit);
                    break;
                }
                delivery = self.broker.pull() => match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        warn!("broker pull failed: {err:#}");
                        drop(permit);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };
            let runtime = self.clone();
            tokio::spawn(async move {
                runtime.handle_delivery(delivery).await;
                drop(permit);
            });
        }

        self.drain().await;
        watcher.abort();
        heartbeat.abort();
        let mut final_beat = crate::heartbeat::beat_from_state(&self.state);
        final_beat.status = WorkerStatus::Idle;
        final_beat.active_simulations = 0;
        final_beat.current_job_id = None;
        if let Err(err) = self.store.upsert_worker_heartbeat(final_beat).await {
            warn!("final heartbeat failed: {err:#}");
        }
        Ok(())
    }

    /// No-broker mode: claim whole jobs from the queue and work their sims
    /// with bounded local concurrency.
    pub async fn run_polling(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        if let Err(err) = self.containers.prune_orphans().await {
            warn!("startup container prune failed: {err:#}");
        }
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.state.clone(),
            shutdown.clone(),
        ));
        let watcher = tokio::spawn(self.clone().watch_cancellations(shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
            }
            let job = match self
                .store
                .claim_next_job(
                    Some(self.state.worker_id.as_str()),
                    Some(self.state.worker_name.as_str()),
                )
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    warn!("claim poll failed: {err:#}");
                    continue;
                }
            };
            info!(job_id = %job.id, "claimed job in polling mode");
            let count = container_count(job.simulations);
            if let Err(err) = self.store.initialize_simulations(&job.id, count).await {
                warn!(job_id = %job.id, "failed to initialize sims: {err:#}");
                continue;
            }
            let sims = match self.store.get_simulation_statuses(&job.id).await {
                Ok(sims) => sims,
                Err(err) => {
                    warn!(job_id = %job.id, "failed to list sims: {err:#}");
                    continue;
                }
            };
            let width = self
                .state
                .capacity
                .min(job.parallelism.max(1)) as usize;
            let tasks: Vec<SimTask> = sims
                .iter()
                .filter(|sim| sim.state == SimState::Pending)
                .map(|sim| SimTask {
                    job_id: job.id.clone(),
                    sim_id: sim.sim_id.clone(),
                    sim_index: sim.index,
                    total_sims: count,
                })
                .collect();
            futures::stream::iter(tasks.into_iter().map(|task| {
                let runtime = self.clone();
                async move {
                    runtime.process_task(&task).await;
                }
            }))
            .buffer_unordered(width.max(1))
            .collect::<Vec<()>>()
            .await;
        }

        self.drain().await;
        watcher.abort();
        heartbeat.abort();
        Ok(())
    }

    async fn drain(&self) {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while self.state.active() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        if self.state.active() > 0 {
            warn!(
                active = self.state.active(),
                "drain deadline passed, aborting remaining containers"
            );
            for job_id in self.cancellations.tracked_jobs() {
                self.cancellations.cancel_job(&job_id);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Watch tracked jobs for user cancellation and trip the per-job abort
    /// token when one is observed.
    async fn watch_cancellations(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
            }
            for job_id in self.cancellations.tracked_jobs() {
                match self.store.get_job(&job_id).await {
                    Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                        info!(job_id = %job_id, "job cancelled, aborting its containers");
                        self.cancellations.cancel_job(&job_id);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => self.cancellations.cancel_job(&job_id),
                    Err(err) => warn!(job_id = %job_id, "cancellation poll failed: {err:#}"),
                }
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        if delivery.attempt > 1 {
            info!(
                job_id = %delivery.task.job_id,
                sim_id = %delivery.task.sim_id,
                attempt = delivery.attempt,
                "handling redelivered task"
            );
        }
        self.process_task(&delivery.task).await;
        // Ack unconditionally: every store write above was guarded, so a
        // duplicate that lost its race has nothing left to do.
        if let Err(err) = self.broker.ack(&delivery).await {
            warn!(sim_id = %delivery.task.sim_id, "ack failed: {err:#}");
        }
    }

    /// Steps 1-8 of the task protocol. Never returns an error: failures
    /// are written to the store (guarded) or logged, and the caller acks.
    /// Public so polling mode and embedded deployments drive it directly.
    pub async fn process_task(&self, task: &SimTask) {
        let SimTask {
            job_id, sim_id, ..
        } = task;

        // 1. Claim. PENDING for the first delivery, FAILED for retries.
        let claim = SimulationPatch {
            state: Some(SimState::Running),
            worker_id: Some(self.state.worker_id.clone()),
            worker_name: Some(self.state.worker_name.clone()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        match self
            .store
            .conditional_update_simulation_status(
                job_id,
                sim_id,
                &[SimState::Pending, SimState::Failed],
                claim,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Sim already progressed (duplicate delivery); drop.
                return;
            }
            Err(err) => {
                warn!(job_id = %job_id, sim_id = %sim_id, "claim failed: {err:#}");
                return;
            }
        }
        self.state.task_started(job_id);
        let result = self.run_claimed_sim(task).await;
        self.state.task_finished();
        if let Err(err) = result {
            warn!(job_id = %job_id, sim_id = %sim_id, "task handling failed: {err:#}");
        }
    }

    async fn run_claimed_sim(&self, task: &SimTask) -> anyhow::Result<()> {
        let SimTask {
            job_id,
            sim_id,
            sim_index,
            ..
        } = task;
        self.progress
            .update_sim_progress(
                job_id,
                sim_id,
                json!({ "state": SimState::Running, "workerId": self.state.worker_id }),
            )
            .await;

        // 2. The job must still be live.
        let Some(job) = self.store.get_job(job_id).await? else {
            self.store
                .conditional_update_simulation_status(
                    job_id,
                    sim_id,
                    &[SimState::Running],
                    SimulationPatch {
                        state: Some(SimState::Cancelled),
                        completed_at: Some(Utc::now()),
                        error_message: Some("Job no longer exists".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        };
        if job.status.is_terminal() {
            let applied = self
                .store
                .conditional_update_simulation_status(
                    job_id,
                    sim_id,
                    &[SimState::Running],
                    SimulationPatch {
                        state: Some(SimState::Cancelled),
                        completed_at: Some(Utc::now()),
                        error_message: Some("Cancelled".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            if applied {
                self.settle_terminal_sim(job_id).await;
            }
            return Ok(());
        }

        // 3. First worker to get here flips the job RUNNING.
        let now = Utc::now();
        let flipped = self
            .store
            .conditional_update_job_status(
                job_id,
                &[JobStatus::Queued],
                JobStatus::Running,
                JobPatch {
                    started_at: Some(now),
                    claimed_at: Some(now),
                    worker_id: Some(self.state.worker_id.clone()),
                    worker_name: Some(self.state.worker_name.clone()),
                    ..Default::default()
                },
            )
            .await?;
        if flipped {
            self.progress
                .update_job_progress(job_id, json!({ "status": JobStatus::Running }))
                .await;
        }

        // 4. Deck contents come from the job row (resolved at dispatch).
        if job.decks.len() != DECKS_PER_JOB {
            self.store
                .conditional_update_simulation_status(
                    job_id,
                    sim_id,
                    &[SimState::Running],
                    SimulationPatch {
                        state: Some(SimState::Failed),
                        completed_at: Some(Utc::now()),
                        error_message: Some(format!(
                            "job carries {} decks, expected {DECKS_PER_JOB}",
                            job.decks.len()
                        )),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        // 5. Run the container under the per-job abort token.
        let cancel = self.cancellations.token_for(job_id);
        let outcome = self
            .containers
            .run(
                RunRequest {
                    job_id: job_id.clone(),
                    sim_id: sim_id.clone(),
                    index: *sim_index,
                    decks: job.decks.clone(),
                },
                cancel.child_token(),
            )
            .await;
        let run = match outcome {
            Ok(RunOutcome::AlreadyRunning) => {
                // Another delivery of this very task owns the container.
                return Ok(());
            }
            Ok(RunOutcome::Finished(run)) => run,
            Err(err) => {
                self.store
                    .conditional_update_simulation_status(
                        job_id,
                        sim_id,
                        &[SimState::Running],
                        SimulationPatch {
                            state: Some(SimState::Failed),
                            completed_at: Some(Utc::now()),
                            error_message: Some(format!("container start failed: {err}")),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(());
            }
        };

        let finished_at = Utc::now();
        if run.exit_code == 0 {
            // 6. Success: parse outcomes, upload the raw log *before* the
            // terminal write so a COMPLETED sim always has its blob.
            let parsed = self.parser.parse(&run.log_text);
            self.blob
                .put(
                    &raw_log_path(job_id, sim_index + 1),
                    run.log_text.clone().into_bytes(),
                )
                .await?;
            let applied = self
                .store
                .conditional_update_simulation_status(
                    job_id,
                    sim_id,
                    &[SimState::Pending, SimState::Running, SimState::Failed],
                    SimulationPatch {
                        state: Some(SimState::Completed),
                        completed_at: Some(finished_at),
                        duration_ms: Some(run.duration_ms),
                        winners: Some(parsed.winners),
                        winning_turns: Some(parsed.winning_turns),
                        ..Default::default()
                    },
                )
                .await?;
            if applied {
                self.progress
                    .update_sim_progress(
                        job_id,
                        sim_id,
                        json!({ "state": SimState::Completed, "durationMs": run.duration_ms }),
                    )
                    .await;
                self.settle_terminal_sim(job_id).await;
            }
        } else if run.exit_code == EXIT_CANCELLED {
            let applied = self
                .store
                .conditional_update_simulation_status(
                    job_id,
                    sim_id,
                    &[SimState::Running],
                    SimulationPatch {
                        state: Some(SimState::Cancelled),
                        completed_at: Some(finished_at),
                        duration_ms: Some(run.duration_ms),
                        error_message: Some("Cancelled".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            if applied {
                self.settle_terminal_sim(job_id).await;
            }
        } else {
            // 7. Failure (including exit 124 timeouts): recovery retries.
            let applied = self
                .store
                .conditional_update_simulation_status(
                    job_id,
                    sim_id,
                    &[SimState::Running],
                    SimulationPatch {
                        state: Some(SimState::Failed),
                        completed_at: Some(finished_at),
                        duration_ms: Some(run.duration_ms),
                        error_message: run
                            .error
                            .clone()
                            .or_else(|| Some(format!("exit code {}", run.exit_code))),
                        ..Default::default()
                    },
                )
                .await?;
            if applied {
                self.progress
                    .update_sim_progress(
                        job_id,
                        sim_id,
                        json!({ "state": SimState::Failed, "errorMessage": run.error }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Step 8: bump the terminal counter; the worker that lands the final
    /// terminal transition flags and kicks aggregation.
    async fn settle_terminal_sim(&self, job_id: &str) {
        let progress = match self.store.increment_completed_sim_count(job_id).await {
            Ok(progress) => progress,
            Err(err) => {
                warn!(job_id = %job_id, "counter increment failed: {err:#}");
                return;
            }
        };
        self.progress
            .update_job_progress(
                job_id,
                json!({ "completedSimCount": progress.completed_sim_count }),
            )
            .await;
        if progress.all_done() {
            self.cancellations.forget_job(job_id);
            if let Err(err) = self.store.set_needs_aggregation(job_id, true).await {
                warn!(job_id = %job_id, "failed to flag aggregation: {err:#}");
                return;
            }
            if let Err(err) = self.aggregator.aggregate(job_id).await {
                // Non-fatal: needsAggregation stays set, recovery retries.
                warn!(job_id = %job_id, "aggregation failed: {err:#}");
            }
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.config.broker_visibility_timeout()
    }
}
