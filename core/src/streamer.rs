use crate::progress::ProgressChannel;
use crate::recovery::RecoveryEngine;
use async_stream::stream;
use chrono::DateTime;
use chrono::Utc;
use futures::Stream;
use podsim_protocol::Job;
use podsim_protocol::JobSnapshot;
use podsim_protocol::JobStatus;
use podsim_protocol::SimulationsEvent;
use podsim_protocol::StreamEvent;
use podsim_protocol::WorkerPoolSummary;
use podsim_state::Store;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Emit on change-feed signals from the progress channel.
    Push,
    /// Snapshot on an interval and diff against the last emission.
    Poll,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamerConfig {
    pub mode: StreamMode,
    pub poll_interval: Duration,
    pub recovery_interval: Duration,
    pub queue_position_ttl: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Poll,
            poll_interval: Duration::from_secs(2),
            recovery_interval: Duration::from_secs(30),
            queue_position_ttl: Duration::from_secs(10),
        }
    }
}

/// Process-global cache of the QUEUED-job list used for queue positions;
/// one lookup serves every open stream for its TTL.
struct QueuePositionCache {
    ttl: Duration,
    entries: Mutex<Option<(Instant, Vec<(String, DateTime<Utc>)>)>>,
}

impl QueuePositionCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(None),
        }
    }

    async fn position(&self, store: &Arc<dyn Store>, job: &Job) -> Option<u32> {
        if job.status != JobStatus::Queued {
            return None;
        }
        let cached = {
            let guard = self.lock_entries();
            guard
                .as_ref()
                .filter(|(fetched, _)| fetched.elapsed() < self.ttl)
                .map(|(_, entries)| entries.clone())
        };
        let entries = match cached {
            Some(entries) => entries,
            None => {
                let jobs = store.list_active_jobs().await.ok()?;
                let entries: Vec<(String, DateTime<Utc>)> = jobs
                    .into_iter()
                    .filter(|job| job.status == JobStatus::Queued)
                    .map(|job| (job.id, job.created_at))
                    .collect();
                *self.lock_entries() = Some((Instant::now(), entries.clone()));
                entries
            }
        };
        let ahead = entries
            .iter()
            .filter(|(id, created_at)| *id != job.id && *created_at <= job.created_at)
            .count();
        Some(ahead as u32)
    }

    fn lock_entries(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<(Instant, Vec<(String, DateTime<Utc>)>)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Emits (job, simulations) snapshots to one observer until the job is
/// terminal or the observer goes away. Never blocks recovery: emissions go
/// through the returned stream and a slow consumer only delays itself.
pub struct ProgressStreamer {
    store: Arc<dyn Store>,
    progress: Arc<dyn ProgressChannel>,
    recovery: Arc<RecoveryEngine>,
    config: StreamerConfig,
    queue_cache: QueuePositionCache,
}

impl ProgressStreamer {
    pub fn new(
        store: Arc<dyn Store>,
        progress: Arc<dyn ProgressChannel>,
        recovery: Arc<RecoveryEngine>,
        config: StreamerConfig,
    ) -> Self {
        let queue_cache = QueuePositionCache::new(config.queue_position_ttl);
        Self {
            store,
            progress,
            recovery,
            config,
            queue_cache,
        }
    }

    async fn job_snapshot(&self, job: &Job) -> JobSnapshot {
        let sims = self
            .store
            .get_simulation_statuses(&job.id)
            .await
            .ok();
        let mut snapshot = JobSnapshot::project(job, sims.as_deref());
        snapshot.queue_position = self.queue_cache.position(&self.store, job).await;
        if job.status == JobStatus::Queued {
            if let Ok(workers) = self.store.list_active_workers().await {
                snapshot.worker_pool = Some(WorkerPoolSummary {
                    active_workers: workers.len() as u32,
                    total_capacity: workers.iter().map(|worker| worker.capacity).sum(),
                    busy_simulations: workers
                        .iter()
                        .map(|worker| worker.active_simulations)
                        .sum(),
                });
            }
        }
        snapshot
    }

    /// The snapshot sequence for one observer. One job event and one
    /// simulations event are always emitted on open; afterwards only
    /// changes are emitted; the stream ends after the first terminal job
    /// snapshot.
    pub fn stream(self: Arc<Self>, job_id: String) -> impl Stream<Item = StreamEvent> + Send {
        let streamer = self;
        stream! {
            let Ok(Some(job)) = streamer.store.get_job(&job_id).await else {
                return;
            };

            // Kick recovery once on open for non-terminal jobs so a stream
            // opened on a stalled job un-sticks it.
            if job.status.is_active() {
                let recovery = streamer.recovery.clone();
                let recover_id = job_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = recovery.recover_job(&recover_id).await {
                        warn!(job_id = %recover_id, "stream-open recovery failed: {err:#}");
                    }
                });
            }

            let snapshot = streamer.job_snapshot(&job).await;
            let mut last_job = serde_json::to_string(&snapshot).unwrap_or_default();
            yield StreamEvent::Job(Box::new(snapshot));

            let sims = streamer
                .store
                .get_simulation_statuses(&job_id)
                .await
                .unwrap_or_default();
            let event = SimulationsEvent { simulations: sims };
            let mut last_sims = serde_json::to_string(&event).unwrap_or_default();
            yield StreamEvent::Simulations(event);

            if job.status.is_terminal() {
                return;
            }

            let mut change_feed = match streamer.config.mode {
                StreamMode::Push => streamer.progress.subscribe(),
                StreamMode::Poll => None,
            };
            let mut recovery_tick = tokio::time::interval(streamer.config.recovery_interval);
            recovery_tick.reset();

            loop {
                let mut feed_lost = false;
                match change_feed.as_mut() {
                    Some(feed) => {
                        tokio::select! {
                            changed = feed.recv() => {
                                match changed {
                                    Ok(changed_job) if changed_job == job_id => {}
                                    Ok(_) => continue,
                                    Err(_) => {
                                        // Feed lagged or closed; degrade to
                                        // interval polling.
                                        debug!(job_id = %job_id, "change feed lost, polling instead");
                                        feed_lost = true;
                                    }
                                }
                            }
                            _ = recovery_tick.tick() => {
                                streamer.kick_recovery(&job_id);
                                continue;
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(streamer.config.poll_interval) => {}
                            _ = recovery_tick.tick() => {
                                streamer.kick_recovery(&job_id);
                                continue;
                            }
                        }
                    }
                }
                if feed_lost {
                    change_feed = None;
                    continue;
                }

                let Ok(Some(job)) = streamer.store.get_job(&job_id).await else {
                    return;
                };
                let snapshot = streamer.job_snapshot(&job).await;
                let serialized = serde_json::to_string(&snapshot).unwrap_or_default();
                if serialized != last_job {
                    last_job = serialized;
                    yield StreamEvent::Job(Box::new(snapshot));
                }

                let sims = streamer
                    .store
                    .get_simulation_statuses(&job_id)
                    .await
                    .unwrap_or_default();
                let event = SimulationsEvent { simulations: sims };
                let serialized = serde_json::to_string(&event).unwrap_or_default();
                if serialized != last_sims {
                    last_sims = serialized;
                    yield StreamEvent::Simulations(event);
                }

                if job.status.is_terminal() {
                    return;
                }
            }
        }
    }

    fn kick_recovery(&self, job_id: &str) {
        let recovery = self.recovery.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = recovery.recover_job(&job_id).await {
                warn!(job_id = %job_id, "stream recovery tick failed: {err:#}");
            }
        });
    }
}
