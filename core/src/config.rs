use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Extra slack the broker grants a lease beyond the container's hard
/// timeout, so a healthy worker never loses a lease for a run that is
/// still within budget.
const VISIBILITY_PADDING: Duration = Duration::from_secs(5 * 60);

/// Process-wide knobs, resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Memory budget per simulation container, MiB.
    pub ram_per_sim_mb: u64,
    /// Host memory held back from capacity planning, MiB.
    pub system_reserve_mb: u64,
    /// Hard wall-clock limit for one container run.
    pub container_timeout: Duration,
    /// Upper bound on concurrent simulations per worker.
    pub max_concurrent_sims: u32,
    /// CPUs granted to each simulation container.
    pub cpus_per_sim: u32,
    /// Docker image executing the games.
    pub simulation_image: String,
    /// Shared secret authenticating worker-facing endpoints.
    pub worker_shared_secret: Option<String>,
    /// Root directory for the embedded store and the blob store.
    pub data_dir: PathBuf,
    /// Cloud project id; presence selects the document-DB backend.
    pub cloud_project: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ram_per_sim_mb: 1200,
            system_reserve_mb: 2048,
            container_timeout: Duration::from_millis(7_200_000),
            max_concurrent_sims: 6,
            cpus_per_sim: 2,
            simulation_image: "podsim/simulator:latest".to_string(),
            worker_shared_secret: None,
            data_dir: PathBuf::from("data"),
            cloud_project: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ram_per_sim_mb: env_u64("RAM_PER_SIM_MB", defaults.ram_per_sim_mb),
            system_reserve_mb: env_u64("SYSTEM_RESERVE_MB", defaults.system_reserve_mb),
            container_timeout: Duration::from_millis(env_u64(
                "CONTAINER_TIMEOUT_MS",
                defaults.container_timeout.as_millis() as u64,
            )),
            max_concurrent_sims: env_u32("MAX_CONCURRENT_SIMS", defaults.max_concurrent_sims),
            cpus_per_sim: env_u32("CPUS_PER_SIM", defaults.cpus_per_sim),
            simulation_image: std::env::var("SIMULATION_IMAGE")
                .ok()
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.simulation_image),
            worker_shared_secret: std::env::var("WORKER_SHARED_SECRET")
                .ok()
                .filter(|value| !value.is_empty()),
            data_dir: std::env::var("PODSIM_DATA_DIR")
                .ok()
                .filter(|value| !value.is_empty())
                .map_or(defaults.data_dir, PathBuf::from),
            cloud_project: std::env::var("GOOGLE_CLOUD_PROJECT")
                .ok()
                .filter(|value| !value.is_empty()),
        }
    }

    /// Broker leases outlive the container budget so only dead consumers
    /// trigger redelivery.
    pub fn broker_visibility_timeout(&self) -> Duration {
        self.container_timeout + VISIBILITY_PADDING
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparsable {name}={raw}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparsable {name}={raw}, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}
