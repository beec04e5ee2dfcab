//! Worker runtime: pulls simulation tasks, runs them in Docker containers,
//! and reports guarded state transitions back to the store.

mod cancel;
mod capacity;
mod container;
mod heartbeat;
mod parse;
mod runtime;

pub use cancel::CancellationRegistry;
pub use capacity::compute_capacity;
pub use container::ContainerRun;
pub use container::ContainerRuntime;
pub use container::DockerRunner;
pub use container::EXIT_CANCELLED;
pub use container::EXIT_TIMEOUT;
pub use container::RunOutcome;
pub use container::RunRequest;
pub use container::container_name;
pub use parse::GameLogParser;
pub use parse::ParsedGames;
pub use parse::ResultLineParser;
pub use runtime::WorkerRuntime;
pub use runtime::WorkerState;

use gethostname::gethostname;
use uuid::Uuid;

/// Stable-ish worker identity: a fresh id per process, a human-readable
/// name derived from the host.
pub fn worker_identity() -> (String, String) {
    let worker_id = format!("worker-{}", Uuid::new_v4());
    let worker_name = gethostname().to_string_lossy().into_owned();
    (worker_id, worker_name)
}
