use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Ephemeral low-latency projection of job progress, living beside (never
/// instead of) the canonical store. Writes are fire-and-forget: every
/// implementation logs failures and returns, the engine never blocks on
/// this channel.
#[async_trait]
pub trait ProgressChannel: Send + Sync {
    async fn update_job_progress(&self, job_id: &str, partial: Value);

    async fn update_sim_progress(&self, job_id: &str, sim_id: &str, partial: Value);

    /// Drop the whole projection for a job; called once the job terminates.
    async fn delete_job_progress(&self, job_id: &str);

    /// Change feed of touched job ids for push-mode streaming, when the
    /// backend supports one.
    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}

/// No-op channel for deployments without an ephemeral store.
#[derive(Default)]
pub struct NoopProgressChannel;

#[async_trait]
impl ProgressChannel for NoopProgressChannel {
    async fn update_job_progress(&self, _job_id: &str, _partial: Value) {}

    async fn update_sim_progress(&self, _job_id: &str, _sim_id: &str, _partial: Value) {}

    async fn delete_job_progress(&self, _job_id: &str) {}
}

/// In-memory projection with a broadcast change feed; backs push-mode
/// streaming in the single-binary deployment.
pub struct InMemoryProgressChannel {
    entries: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<String>,
}

impl Default for InMemoryProgressChannel {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl InMemoryProgressChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.lock_entries().get(key).cloned()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn merge(&self, key: String, partial: Value) {
        let mut entries = self.lock_entries();
        let slot = entries.entry(key).or_insert_with(|| Value::Object(Default::default()));
        if let (Value::Object(base), Value::Object(incoming)) = (slot, partial) {
            for (field, value) in incoming {
                base.insert(field, value);
            }
        }
    }
}

#[async_trait]
impl ProgressChannel for InMemoryProgressChannel {
    async fn update_job_progress(&self, job_id: &str, partial: Value) {
        self.merge(format!("jobs/{job_id}"), partial);
        let _ = self.changes.send(job_id.to_string());
    }

    async fn update_sim_progress(&self, job_id: &str, sim_id: &str, partial: Value) {
        self.merge(format!("jobs/{job_id}/simulations/{sim_id}"), partial);
        let _ = self.changes.send(job_id.to_string());
    }

    async fn delete_job_progress(&self, job_id: &str) {
        let prefix = format!("jobs/{job_id}");
        let mut entries = self.lock_entries();
        entries.retain(|key, _| key != &prefix && !key.starts_with(&format!("{prefix}/")));
        drop(entries);
        let _ = self.changes.send(job_id.to_string());
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}
