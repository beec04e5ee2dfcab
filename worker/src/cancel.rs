use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-job abort signals shared by every in-flight container of that job.
/// The job watcher trips a token when it observes the job CANCELLED; task
/// handlers derive their container's abort from it.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token_for(&self, job_id: &str) -> CancellationToken {
        self.lock_tokens()
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    /// Abort every container attached to the job. The token is created if
    /// absent so a task arriving after the cancellation still observes it.
    pub fn cancel_job(&self, job_id: &str) {
        self.lock_tokens()
            .entry(job_id.to_string())
            .or_default()
            .cancel();
    }

    /// Drop the token once the worker has no more sims for the job.
    pub fn forget_job(&self, job_id: &str) {
        self.lock_tokens().remove(job_id);
    }

    pub fn tracked_jobs(&self) -> Vec<String> {
        self.lock_tokens().keys().cloned().collect()
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
