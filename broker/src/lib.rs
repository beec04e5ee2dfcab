//! At-least-once work distribution for per-simulation tasks.
//!
//! The dispatcher publishes one [`SimTask`] per container; workers pull,
//! run, and acknowledge. Deliveries that are neither acked nor nacked
//! become visible again after the visibility timeout, so consumers must be
//! idempotent (they are: every resulting store write is guarded by a
//! conditional update on the state field).

mod memory;

pub use memory::InProcessBroker;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

/// One unit of work: run container `sim_id` (`sim_index` of `total_sims`)
/// for `job_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimTask {
    pub job_id: String,
    pub sim_id: String,
    pub sim_index: u32,
    pub total_sims: u32,
}

/// A leased task. Dropping a delivery without ack/nack lets the visibility
/// timeout re-deliver it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub task: SimTask,
    /// 1-based delivery attempt; > 1 means this is a redelivery.
    pub attempt: u32,
    pub(crate) receipt: u64,
}

#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn publish(&self, task: SimTask) -> anyhow::Result<()>;

    /// Wait for the next visible task and lease it.
    async fn pull(&self) -> anyhow::Result<Delivery>;

    /// Settle a lease. Ack after the guarded store write returned, whether
    /// or not it applied; nack only for infrastructure failures worth an
    /// immediate retry.
    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()>;

    async fn nack(&self, delivery: &Delivery) -> anyhow::Result<()>;
}
