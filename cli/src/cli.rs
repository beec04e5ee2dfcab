use clap::Args;
use clap::Parser;
use clap::ValueEnum;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "podsim", version, about = "Distributed card-game simulation executor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the control plane: HTTP API, dispatcher, recovery loop, and
    /// (by default) an embedded worker sharing the in-process task queue.
    Serve(ServeArgs),
    /// Run a standalone worker in polling mode against the shared store.
    Worker(WorkerArgs),
    /// Run one recovery pass over the active jobs and exit.
    Recover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StreamModeArg {
    /// Emit on progress-channel change signals.
    Push,
    /// Snapshot every two seconds and emit on change.
    Poll,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address for the HTTP API.
    #[arg(long, default_value = "127.0.0.1:8080", env = "PODSIM_LISTEN_ADDR")]
    pub listen: SocketAddr,

    /// Progress-stream backend.
    #[arg(long, value_enum, default_value_t = StreamModeArg::Push)]
    pub stream_mode: StreamModeArg,

    /// Do not run an embedded worker; tasks wait for external workers.
    #[arg(long)]
    pub no_worker: bool,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Override the computed simulation capacity.
    #[arg(long, value_parser = parse_capacity)]
    pub capacity: Option<u32>,
}

fn parse_capacity(input: &str) -> Result<u32, String> {
    let value: u32 = input
        .parse()
        .map_err(|_| "capacity must be a positive integer".to_string())?;
    if (1..=64).contains(&value) {
        Ok(value)
    } else {
        Err("capacity must be between 1 and 64".to_string())
    }
}
