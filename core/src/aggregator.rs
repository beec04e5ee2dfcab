use crate::blob::BlobStore;
use crate::blob::raw_log_path;
use crate::ingest::LogIngestor;
use crate::ingest::RawLogs;
use crate::progress::ProgressChannel;
use crate::rating::RatingUpdater;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_state::Store;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

/// Folds a finished job's per-simulation outputs into the final artifact,
/// updates deck ratings, and clears the ephemeral projection.
///
/// Safe to call at any time: it re-checks the job and simulation states and
/// returns without effect unless every sim is settled in
/// {COMPLETED, CANCELLED}. Failures leave `needsAggregation` set so the
/// recovery engine re-triggers the whole pass.
pub struct Aggregator {
    store: Arc<dyn Store>,
    blob: Arc<dyn BlobStore>,
    ingestor: Arc<dyn LogIngestor>,
    ratings: RatingUpdater,
    progress: Arc<dyn ProgressChannel>,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn Store>,
        blob: Arc<dyn BlobStore>,
        ingestor: Arc<dyn LogIngestor>,
        progress: Arc<dyn ProgressChannel>,
    ) -> Self {
        let ratings = RatingUpdater::new(store.clone());
        Self {
            store,
            blob,
            ingestor,
            ratings,
            progress,
        }
    }

    pub async fn aggregate(&self, job_id: &str) -> anyhow::Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        // Idempotency guard: a finished job never aggregates twice.
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return Ok(());
        }

        let sims = self.store.get_simulation_statuses(job_id).await?;
        if sims.is_empty() {
            return Ok(());
        }
        let all_done = sims
            .iter()
            .all(|sim| matches!(sim.state, SimState::Completed | SimState::Cancelled));
        if !all_done {
            // FAILED sims are about to be retried; not our turn yet.
            return Ok(());
        }

        // Raw logs were uploaded incrementally by the workers; tolerate
        // missing indices.
        let mut raw_logs = RawLogs::new();
        for sim in &sims {
            if sim.state != SimState::Completed {
                continue;
            }
            let path = raw_log_path(job_id, sim.index + 1);
            match self.blob.get(&path).await {
                Ok(Some(bytes)) => {
                    raw_logs.insert(sim.index + 1, String::from_utf8_lossy(&bytes).into_owned());
                }
                Ok(None) => warn!(job_id, path = %path, "raw log missing at aggregation"),
                Err(err) => warn!(job_id, path = %path, "failed to read raw log: {err:#}"),
            }
        }

        let every_sim_cancelled = sims.iter().all(|sim| sim.state == SimState::Cancelled);
        if every_sim_cancelled {
            // Nothing ever ran; there is no artifact to build and no state
            // to change beyond dropping the ephemeral projection.
            self.progress.delete_job_progress(job_id).await;
            return Ok(());
        }

        let artifact = self.ingestor.ingest(&job, &sims, &raw_logs).await?;
        if let Err(err) = self
            .blob
            .put(
                &crate::blob::condensed_path(job_id),
                serde_json::to_vec(&artifact)?,
            )
            .await
        {
            warn!(job_id, "failed to persist condensed artifact: {err:#}");
        }
        self.store.set_job_results(job_id, artifact).await?;

        if job.status == JobStatus::Cancelled {
            // Preserve the cancellation; logs are still ingested above.
            self.store.set_needs_aggregation(job_id, false).await?;
        } else {
            let durations: Vec<u64> = sims.iter().filter_map(|sim| sim.duration_ms).collect();
            self.store.set_job_completed(job_id, Some(durations)).await?;
            info!(job_id, "job aggregated and completed");
        }

        // Ratings are fire-and-forget: failures never alter job status.
        if let Err(err) = self.ratings.apply_job_ratings(&job, &sims).await {
            warn!(job_id, "rating update failed: {err:#}");
        }

        self.progress.delete_job_progress(job_id).await;
        Ok(())
    }
}
