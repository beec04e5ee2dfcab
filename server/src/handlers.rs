use crate::AppState;
use crate::auth::user_from_headers;
use crate::dto::CreateJobBody;
use crate::dto::RecoveryResponse;
use crate::dto::UpdateJobBody;
use crate::dto::UpdateOutcome;
use crate::dto::UpdateSimulationBody;
use crate::error::ApiError;
use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::Sse;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use chrono::Utc;
use futures::Stream;
use futures::StreamExt;
use podsim_core::CoreError;
use podsim_core::CreateJobRequest;
use podsim_protocol::Job;
use podsim_protocol::JobPatch;
use podsim_protocol::JobStatus;
use podsim_protocol::SimState;
use podsim_protocol::SimulationPatch;
use podsim_protocol::StreamEvent;
use podsim_protocol::TransitionRejection;
use podsim_protocol::WorkerInfo;
use serde_json::Value;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tracing::info;
use tracing::warn;

const LIST_LIMIT: usize = 50;

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state
        .dispatcher
        .create_job(CreateJobRequest {
            deck_ids: body.deck_ids,
            decks: body.decks,
            simulations: body.simulations,
            parallelism: body.parallelism,
            idempotency_key: body.idempotency_key,
            created_by: user_from_headers(&headers),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Job>>, ApiError> {
    let user = user_from_headers(&headers);
    let filter = (user != "anonymous").then_some(user);
    let jobs = state.store.list_jobs(filter.as_deref(), LIST_LIMIT).await?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    Ok(Json(job))
}

/// Worker-auth PATCH of the job status. Rejected transitions are HTTP 200
/// `{updated: false}` bodies: under at-least-once delivery a stale worker
/// repeating an old transition is normal, not an error.
pub async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateJobBody>,
) -> Result<Json<UpdateOutcome>, ApiError> {
    let job = state
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    let target = body.status;
    let expected: Vec<JobStatus> = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ]
    .into_iter()
    .filter(|status| status.can_transition_to(target))
    .collect();
    let now = Utc::now();
    let patch = JobPatch {
        started_at: (target == JobStatus::Running && job.started_at.is_none()).then_some(now),
        completed_at: target.is_terminal().then_some(now),
        worker_id: body.worker_id,
        worker_name: body.worker_name,
        error_message: body.error_message,
        ..Default::default()
    };
    let updated = state
        .store
        .conditional_update_job_status(&id, &expected, target, patch)
        .await?;
    if updated {
        Ok(Json(UpdateOutcome::applied()))
    } else {
        let current = state
            .store
            .get_job(&id)
            .await?
            .map_or(job.status, |job| job.status);
        Ok(Json(UpdateOutcome::rejected(TransitionRejection::for_job(
            current, target,
        ))))
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.store.cancel_job(&id).await?;
    if cancelled {
        info!(job_id = %id, "job cancelled by user");
        // The aggregation path still ingests logs of completed sims and
        // clears the ephemeral projection.
        let aggregator = state.aggregator.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = aggregator.aggregate(&job_id).await {
                warn!(job_id = %job_id, "post-cancel aggregation failed: {err:#}");
            }
        });
    }
    Ok(Json(json!({ "cancelled": cancelled })))
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    if !state.store.reset_job_for_retry(&id).await? {
        return Err(CoreError::Conflict(format!(
            "job {id} is {} and cannot be retried",
            job.status.as_str()
        ))
        .into());
    }
    // Failed sims ride along: back to PENDING, then republish everything
    // still pending.
    let sims = state.store.get_simulation_statuses(&id).await?;
    for sim in &sims {
        if sim.state == SimState::Failed {
            state
                .store
                .conditional_update_simulation_status(
                    &id,
                    &sim.sim_id,
                    &[SimState::Failed],
                    SimulationPatch {
                        state: Some(SimState::Pending),
                        ..Default::default()
                    },
                )
                .await?;
        }
    }
    let republished = state.dispatcher.publish_pending_sims(&id).await?;
    info!(job_id = %id, republished, "job reset for retry");
    let job = state
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
    Ok(Json(job))
}

pub async fn update_simulation(
    State(state): State<AppState>,
    Path((job_id, sim_id)): Path<(String, String)>,
    Json(body): Json<UpdateSimulationBody>,
) -> Result<Json<UpdateOutcome>, ApiError> {
    let Some(target) = body.state else {
        // Metadata-only patch, no transition involved.
        state
            .store
            .update_simulation_status(
                &job_id,
                &sim_id,
                SimulationPatch {
                    worker_id: body.worker_id,
                    worker_name: body.worker_name,
                    duration_ms: body.duration_ms,
                    error_message: body.error_message,
                    winners: body.winners,
                    winning_turns: body.winning_turns,
                    ..Default::default()
                }
                .merge_legacy(body.winner, body.winning_turn),
            )
            .await?;
        return Ok(Json(UpdateOutcome::applied()));
    };

    let sim = state
        .store
        .get_simulation_status(&job_id, &sim_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("simulation {job_id}/{sim_id}")))?;
    let expected: Vec<SimState> = [
        SimState::Pending,
        SimState::Running,
        SimState::Completed,
        SimState::Failed,
        SimState::Cancelled,
    ]
    .into_iter()
    .filter(|status| status.can_transition_to(target))
    .collect();
    let now = Utc::now();
    let patch = SimulationPatch {
        state: Some(target),
        worker_id: body.worker_id,
        worker_name: body.worker_name,
        started_at: (target == SimState::Running).then_some(now),
        completed_at: target.is_settled().then_some(now),
        duration_ms: body.duration_ms,
        error_message: body.error_message,
        winners: body.winners,
        winning_turns: body.winning_turns,
    }
    .merge_legacy(body.winner, body.winning_turn);

    let updated = state
        .store
        .conditional_update_simulation_status(&job_id, &sim_id, &expected, patch)
        .await?;
    if !updated {
        let current = state
            .store
            .get_simulation_status(&job_id, &sim_id)
            .await?
            .map_or(sim.state, |sim| sim.state);
        return Ok(Json(UpdateOutcome::rejected(TransitionRejection::for_sim(
            current, target,
        ))));
    }

    if target.is_terminal() {
        settle_terminal_sim(&state, &job_id).await;
    }
    Ok(Json(UpdateOutcome::applied()))
}

/// Counter bump + aggregation kick mirroring the in-process worker path,
/// for workers reporting over HTTP.
async fn settle_terminal_sim(state: &AppState, job_id: &str) {
    let progress = match state.store.increment_completed_sim_count(job_id).await {
        Ok(progress) => progress,
        Err(err) => {
            warn!(job_id = %job_id, "counter increment failed: {err:#}");
            return;
        }
    };
    if progress.all_done() {
        if let Err(err) = state.store.set_needs_aggregation(job_id, true).await {
            warn!(job_id = %job_id, "failed to flag aggregation: {err:#}");
            return;
        }
        let aggregator = state.aggregator.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = aggregator.aggregate(&job_id).await {
                warn!(job_id = %job_id, "aggregation failed: {err:#}");
            }
        });
    }
}

pub async fn recover_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecoveryResponse>, ApiError> {
    let report = state.recovery.recover_job(&id).await?;
    Ok(Json(RecoveryResponse {
        sims_initialized: report.sims_initialized,
        tasks_republished: report.tasks_republished,
        sims_failed: report.sims_failed,
        sims_reset: report.sims_reset,
        aggregation_kicked: report.aggregation_kicked,
    }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Json(info): Json<WorkerInfo>,
) -> Result<Json<Value>, ApiError> {
    state.store.upsert_worker_heartbeat(info).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerInfo>>, ApiError> {
    Ok(Json(state.store.list_active_workers().await?))
}

/// SSE progress stream: the default event is the job snapshot, the named
/// `simulations` event carries the full child list; closes on terminal.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.store.get_job(&id).await?.is_none() {
        return Err(CoreError::NotFound(format!("job {id}")).into());
    }
    let stream = state.streamer.clone().stream(id).map(|event| {
        let event = match event {
            StreamEvent::Job(snapshot) => {
                Event::default().data(serde_json::to_string(&snapshot).unwrap_or_default())
            }
            StreamEvent::Simulations(simulations) => Event::default()
                .event("simulations")
                .data(serde_json::to_string(&simulations).unwrap_or_default()),
        };
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
