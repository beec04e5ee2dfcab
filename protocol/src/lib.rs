//! Shared types for the podsim batch executor.
//!
//! Everything that crosses a crate boundary lives here: the job and
//! simulation entities, their state machines, worker heartbeat records,
//! rating types, and the progress-stream events. The state-machine tables
//! are the single source of truth consumed by the store backends, the
//! worker runtime, and the HTTP surface alike.

mod job;
mod rating;
mod snapshot;
mod worker;

pub use job::CreateJobParams;
pub use job::DeckDescriptor;
pub use job::Job;
pub use job::JobPatch;
pub use job::JobStatus;
pub use job::SimState;
pub use job::Simulation;
pub use job::SimulationPatch;
pub use job::TransitionRejection;
pub use job::TransitionRejectionReason;
pub use job::sim_id_for_index;
pub use rating::DeckRating;
pub use rating::MatchResult;
pub use rating::match_result_id;
pub use snapshot::JobSnapshot;
pub use snapshot::SimulationsEvent;
pub use snapshot::StreamEvent;
pub use snapshot::WorkerPoolSummary;
pub use worker::HEARTBEAT_ACTIVE_WINDOW_SECS;
pub use worker::HEARTBEAT_UPDATING_WINDOW_SECS;
pub use worker::WorkerInfo;
pub use worker::WorkerStatus;

/// Games played by one container. Dispatcher, worker, and aggregator must
/// agree on this value; a job for N games becomes ceil(N / K) containers.
pub const GAMES_PER_CONTAINER: u32 = 4;

/// Inclusive bounds on the requested game count for one job.
pub const MIN_SIMULATIONS: u32 = 4;
pub const MAX_SIMULATIONS: u32 = 100;

/// Inclusive bounds on the per-job parallelism hint.
pub const MIN_PARALLELISM: u32 = 1;
pub const MAX_PARALLELISM: u32 = 16;
pub const DEFAULT_PARALLELISM: u32 = 4;

/// Number of seats at the table; every job carries exactly this many decks.
pub const DECKS_PER_JOB: usize = 4;

/// Containers needed to play `simulations` games.
pub fn container_count(simulations: u32) -> u32 {
    simulations.div_ceil(GAMES_PER_CONTAINER)
}
