mod cli;

use clap::Parser;
use cli::Cli;
use cli::Command;
use cli::ServeArgs;
use cli::StreamModeArg;
use cli::WorkerArgs;
use podsim_broker::InProcessBroker;
use podsim_core::Aggregator;
use podsim_core::Config;
use podsim_core::Dispatcher;
use podsim_core::FsBlobStore;
use podsim_core::InMemoryProgressChannel;
use podsim_core::NoopProgressChannel;
use podsim_core::ProgressChannel;
use podsim_core::ProgressStreamer;
use podsim_core::RecoveryEngine;
use podsim_core::RecoveryThresholds;
use podsim_core::StaticDeckResolver;
use podsim_core::StreamMode;
use podsim_core::StreamerConfig;
use podsim_core::SummaryIngestor;
use podsim_server::AppState;
use podsim_state::Store;
use podsim_state::StoreConfig;
use podsim_state::init_store;
use podsim_worker::DockerRunner;
use podsim_worker::ResultLineParser;
use podsim_worker::WorkerRuntime;
use podsim_worker::WorkerState;
use podsim_worker::compute_capacity;
use podsim_worker::worker_identity;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const RECOVERY_INTERVAL: Duration = Duration::from_secs(45);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}

struct Engine {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    broker: Arc<InProcessBroker>,
    progress: Arc<dyn ProgressChannel>,
    blob: Arc<FsBlobStore>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<Aggregator>,
    recovery: Arc<RecoveryEngine>,
}

async fn build_engine(progress: Arc<dyn ProgressChannel>) -> anyhow::Result<Engine> {
    let config = Arc::new(Config::from_env());
    let store = init_store(StoreConfig::from_env(config.data_dir.clone())).await?;
    let broker = Arc::new(InProcessBroker::new(config.broker_visibility_timeout()));
    let blob = Arc::new(FsBlobStore::new(config.data_dir.join("blobs")));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        broker.clone(),
        Arc::new(StaticDeckResolver::default()),
        progress.clone(),
    ));
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        blob.clone(),
        Arc::new(SummaryIngestor),
        progress.clone(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        store.clone(),
        dispatcher.clone(),
        aggregator.clone(),
        RecoveryThresholds::default(),
    ));
    Ok(Engine {
        config,
        store,
        broker,
        progress,
        blob,
        dispatcher,
        aggregator,
        recovery,
    })
}

fn build_worker(engine: &Engine, capacity_override: Option<u32>) -> Arc<WorkerRuntime> {
    let (worker_id, worker_name) = worker_identity();
    let capacity = capacity_override
        .unwrap_or_else(|| compute_capacity(&engine.config, None));
    let state = Arc::new(WorkerState::new(worker_id, worker_name, capacity));
    Arc::new(WorkerRuntime::new(
        engine.store.clone(),
        engine.broker.clone(),
        engine.blob.clone(),
        engine.aggregator.clone(),
        Arc::new(DockerRunner::new(engine.config.clone())),
        Arc::new(ResultLineParser),
        engine.progress.clone(),
        engine.config.clone(),
        state,
    ))
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let progress: Arc<dyn ProgressChannel> = Arc::new(InMemoryProgressChannel::new());
    let engine = build_engine(progress).await?;

    let streamer_config = StreamerConfig {
        mode: match args.stream_mode {
            StreamModeArg::Push => StreamMode::Push,
            StreamModeArg::Poll => StreamMode::Poll,
        },
        ..StreamerConfig::default()
    };
    let streamer = Arc::new(ProgressStreamer::new(
        engine.store.clone(),
        engine.progress.clone(),
        engine.recovery.clone(),
        streamer_config,
    ));

    let recovery_loop = engine.recovery.clone().spawn_loop(RECOVERY_INTERVAL);

    let shutdown = CancellationToken::new();
    let worker_handle = if args.no_worker {
        None
    } else {
        let worker = build_worker(&engine, None);
        info!(capacity = worker.state().capacity, "starting embedded worker");
        Some(tokio::spawn(worker.run(shutdown.clone())))
    };

    let state = AppState {
        store: engine.store.clone(),
        dispatcher: engine.dispatcher.clone(),
        aggregator: engine.aggregator.clone(),
        recovery: engine.recovery.clone(),
        streamer,
        progress: engine.progress.clone(),
        worker_shared_secret: engine.config.worker_shared_secret.clone(),
    };
    let result = podsim_server::serve(state, args.listen).await;

    shutdown.cancel();
    if let Some(handle) = worker_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("embedded worker exited with error: {err:#}"),
            Err(err) => tracing::warn!("embedded worker task failed: {err:#}"),
        }
    }
    recovery_loop.abort();
    result
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let engine = build_engine(Arc::new(NoopProgressChannel)).await?;
    let worker = build_worker(&engine, args.capacity);
    info!(
        worker_id = %worker.state().worker_id,
        capacity = worker.state().capacity,
        "starting standalone worker (polling mode)"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, draining");
            signal_token.cancel();
        }
    });
    worker.run_polling(shutdown).await
}

async fn recover_once() -> anyhow::Result<()> {
    let engine = build_engine(Arc::new(NoopProgressChannel)).await?;
    engine.recovery.run_pass().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Worker(args) => run_worker(args).await,
        Command::Recover => recover_once().await,
    }
}
