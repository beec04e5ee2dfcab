//! HTTP surface of the batch executor: job CRUD for users, guarded state
//! reporting for workers, and the SSE progress stream.

mod auth;
mod dto;
mod error;
mod handlers;

pub use auth::WORKER_SECRET_HEADER;
pub use dto::CreateJobBody;
pub use dto::UpdateOutcome;
pub use dto::UpdateSimulationBody;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use axum::routing::patch;
use axum::routing::post;
use podsim_core::Aggregator;
use podsim_core::Dispatcher;
use podsim_core::ProgressChannel;
use podsim_core::ProgressStreamer;
use podsim_core::RecoveryEngine;
use podsim_state::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub aggregator: Arc<Aggregator>,
    pub recovery: Arc<RecoveryEngine>,
    pub streamer: Arc<ProgressStreamer>,
    pub progress: Arc<dyn ProgressChannel>,
    pub worker_shared_secret: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let worker_routes = Router::new()
        .route("/jobs/{id}", patch(handlers::update_job))
        .route(
            "/jobs/{id}/simulations/{sim_id}",
            patch(handlers::update_simulation),
        )
        .route("/jobs/{id}/recover", post(handlers::recover_job))
        .route("/workers/heartbeat", post(handlers::heartbeat))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_worker_secret,
        ));
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/jobs", post(handlers::create_job).get(handlers::list_jobs))
        .route(
            "/jobs/{id}",
            get(handlers::get_job).delete(handlers::cancel_job),
        )
        .route("/jobs/{id}/retry", post(handlers::retry_job))
        .route("/jobs/{id}/stream", get(handlers::stream_job))
        .route("/workers", get(handlers::list_workers))
        .merge(worker_routes)
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to install ctrl-c handler: {err:#}");
    }
}
