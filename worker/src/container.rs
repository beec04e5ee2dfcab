use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use podsim_core::Config;
use podsim_protocol::DeckDescriptor;
use podsim_protocol::GAMES_PER_CONTAINER;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_CANCELLED: i32 = 137;

const STDERR_ERROR_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: String,
    pub sim_id: String,
    pub index: u32,
    pub decks: Vec<DeckDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub log_text: String,
    pub error: Option<String>,
}

/// Result of one container run. A duplicate delivery that finds its
/// container already running gets the sentinel and simply acks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    AlreadyRunning,
    Finished(ContainerRun),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome>;

    /// Startup housekeeping: remove leftover `sim-*` containers and
    /// dangling images from a previous worker life.
    async fn prune_orphans(&self) -> anyhow::Result<()>;
}

/// Deterministic name shared by every delivery of the same task, which is
/// what makes duplicate container starts detectable.
pub fn container_name(job_id: &str, sim_id: &str) -> String {
    let prefix: String = job_id.chars().take(8).collect();
    format!("sim-{prefix}-{sim_id}")
}

fn truncate_error(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_ERROR_LIMIT {
        trimmed.to_string()
    } else {
        let mut cut = STDERR_ERROR_LIMIT;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        trimmed[..cut].to_string()
    }
}

/// Environment block carrying the decks into the container, base64-encoded
/// so arbitrary deck-list text survives the CLI boundary.
fn deck_env(decks: &[DeckDescriptor]) -> Vec<(String, String)> {
    let mut env = vec![
        ("GAMES".to_string(), GAMES_PER_CONTAINER.to_string()),
        ("DECK_COUNT".to_string(), decks.len().to_string()),
    ];
    for (seat, deck) in decks.iter().enumerate() {
        env.push((format!("DECK_{}_NAME", seat + 1), deck.name.clone()));
        env.push((
            format!("DECK_{}_LIST", seat + 1),
            BASE64.encode(deck.content.as_bytes()),
        ));
    }
    env
}

/// Runs simulations by shelling to the `docker` CLI: hard memory/CPU
/// limits, a wall-clock timeout, and cooperative cancellation, with the
/// container's stdout buffered as the game log.
pub struct DockerRunner {
    config: Arc<Config>,
}

impl DockerRunner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    async fn docker(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }

    async fn is_running(&self, name: &str) -> anyhow::Result<bool> {
        let filter = format!("name=^{name}$");
        let output = self
            .docker(&["ps", "-q", "--filter", filter.as_str()])
            .await?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn force_remove(&self, name: &str) {
        match self.docker(&["rm", "-f", name]).await {
            Ok(output) if output.status.success() => {
                debug!(container = name, "removed container");
            }
            Ok(_) => {}
            Err(err) => warn!(container = name, "docker rm failed: {err:#}"),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let name = container_name(&request.job_id, &request.sim_id);
        if self.is_running(&name).await? {
            info!(container = %name, "container already running, treating delivery as duplicate");
            return Ok(RunOutcome::AlreadyRunning);
        }
        // A stopped leftover with our name would make `docker run` fail.
        self.force_remove(&name).await;

        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("--name")
            .arg(&name)
            .arg("--memory")
            .arg(format!("{}m", self.config.ram_per_sim_mb))
            .arg("--cpus")
            .arg(self.config.cpus_per_sim.to_string());
        for (key, value) in deck_env(&request.decks) {
            command.arg("--env").arg(format!("{key}={value}"));
        }
        command
            .arg(&self.config.simulation_image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn()?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_reader = tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Some(stdout) = stdout.as_mut() {
                let _ = stdout.read_to_end(&mut buffer).await;
            }
            buffer
        });
        let stderr_reader = tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_end(&mut buffer).await;
            }
            buffer
        });

        let timeout = self.config.container_timeout;
        let outcome = tokio::select! {
            status = child.wait() => Ok(status?),
            _ = tokio::time::sleep(timeout) => Err((EXIT_TIMEOUT, "Container timed out")),
            _ = cancel.cancelled() => Err((EXIT_CANCELLED, "Cancelled")),
        };

        let (exit_code, forced_error) = match outcome {
            Ok(status) => (status.code().unwrap_or(-1), None),
            Err((code, message)) => {
                // Stop the container first so the CLI child exits and the
                // output readers see EOF, then reap the child.
                self.force_remove(&name).await;
                let _ = child.start_kill();
                let _ = child.wait().await;
                (code, Some(message.to_string()))
            }
        };

        let stdout_bytes = stdout_reader.await.unwrap_or_default();
        let stderr_bytes = stderr_reader.await.unwrap_or_default();
        let log_text = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = match (&forced_error, exit_code) {
            (Some(message), _) => Some(message.clone()),
            (None, 0) => None,
            (None, code) => {
                let stderr_text = truncate_error(&String::from_utf8_lossy(&stderr_bytes));
                if stderr_text.is_empty() {
                    Some(format!("container exited with code {code}"))
                } else {
                    Some(stderr_text)
                }
            }
        };

        if forced_error.is_none() {
            self.force_remove(&name).await;
        }

        Ok(RunOutcome::Finished(ContainerRun {
            exit_code,
            duration_ms,
            log_text,
            error,
        }))
    }

    async fn prune_orphans(&self) -> anyhow::Result<()> {
        let output = self
            .docker(&["ps", "-aq", "--filter", "name=sim-"])
            .await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "pruning orphaned simulation containers");
            let mut args = vec!["rm", "-f"];
            args.extend(ids.iter().map(String::as_str));
            let _ = self.docker(&args).await;
        }
        let _ = self.docker(&["image", "prune", "-f"]).await;
        Ok(())
    }
}
