use crate::Delivery;
use crate::SimTask;
use crate::TaskBroker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

struct QueuedTask {
    task: SimTask,
    attempt: u32,
}

struct InflightTask {
    task: SimTask,
    attempt: u32,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedTask>,
    inflight: HashMap<u64, InflightTask>,
    next_receipt: u64,
}

impl QueueState {
    /// Move expired leases back to the ready queue. Returns the nearest
    /// remaining deadline so a waiting puller knows when to re-check.
    fn requeue_expired(&mut self, now: Instant) -> Option<Instant> {
        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(lease) = self.inflight.remove(&receipt) {
                debug!(
                    job_id = %lease.task.job_id,
                    sim_id = %lease.task.sim_id,
                    attempt = lease.attempt,
                    "visibility timeout expired, re-queueing task"
                );
                self.ready.push_back(QueuedTask {
                    task: lease.task,
                    attempt: lease.attempt,
                });
            }
        }
        self.inflight.values().map(|lease| lease.deadline).min()
    }
}

/// In-process broker backing the single-binary deployment and the tests.
/// At-least-once: a lease that is not settled within the visibility
/// timeout is handed out again with a bumped attempt counter.
pub struct InProcessBroker {
    state: Mutex<QueueState>,
    available: Arc<Notify>,
    visibility_timeout: Duration,
}

impl InProcessBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    /// Tasks currently leased out (for observability and tests).
    pub fn inflight_count(&self) -> usize {
        self.lock_state().inflight.len()
    }

    pub fn ready_count(&self) -> usize {
        self.lock_state().ready.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Lock poisoning would mean a panic while holding the lock, which
        // the queue cannot recover from anyway.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl TaskBroker for InProcessBroker {
    async fn publish(&self, task: SimTask) -> anyhow::Result<()> {
        {
            let mut state = self.lock_state();
            state.ready.push_back(QueuedTask { task, attempt: 0 });
        }
        self.available.notify_one();
        Ok(())
    }

    async fn pull(&self) -> anyhow::Result<Delivery> {
        loop {
            let next_deadline = {
                let mut state = self.lock_state();
                let now = Instant::now();
                let next_deadline = state.requeue_expired(now);
                if let Some(queued) = state.ready.pop_front() {
                    state.next_receipt += 1;
                    let receipt = state.next_receipt;
                    let attempt = queued.attempt + 1;
                    state.inflight.insert(
                        receipt,
                        InflightTask {
                            task: queued.task.clone(),
                            attempt,
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Delivery {
                        task: queued.task,
                        attempt,
                        receipt,
                    });
                }
                next_deadline
            };
            // Nothing ready: wait for a publish/nack, or until the nearest
            // lease can expire.
            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.available.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.available.notified().await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let mut state = self.lock_state();
        state.inflight.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        {
            let mut state = self.lock_state();
            if let Some(lease) = state.inflight.remove(&delivery.receipt) {
                state.ready.push_back(QueuedTask {
                    task: lease.task,
                    attempt: lease.attempt,
                });
            }
        }
        self.available.notify_one();
        Ok(())
    }
}
