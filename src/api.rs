//! HTTP control surface for browser jobs, manual sends, and batch draining.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{JobSpec, Orchestrator};
use crate::error::{JobError, StoreError};
use crate::router::Router as DispatchRouter;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub router: Arc<DispatchRouter>,
}

/// Build the axum router with every control route.
pub fn control_routes(orchestrator: Orchestrator, router: Arc<DispatchRouter>) -> Router {
    let state = AppState {
        orchestrator,
        router,
    };

    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/resume", post(resume_job))
        .route("/approvals/{id}/confirm", post(confirm_manual))
        .route("/approvals/{id}/fail", post(fail_manual))
        .route("/dispatch/drain", post(drain))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid ID"))
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Conflict { .. } | StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn job_error(e: JobError) -> Response {
    let status = match &e {
        JobError::NotFound { .. } => StatusCode::NOT_FOUND,
        JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        JobError::InvalidSpec { .. } => StatusCode::BAD_REQUEST,
        JobError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        JobError::Store(inner) => store_status(inner),
    };
    error(status, e)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_jobs": state.orchestrator.live_jobs().await,
    }))
}

// ── Browser jobs ────────────────────────────────────────────────────

async fn submit_job(State(state): State<AppState>, Json(spec): Json<JobSpec>) -> Response {
    match state.orchestrator.submit(spec).await {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({ "job_id": id }))).into_response(),
        Err(e) => job_error(e),
    }
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.orchestrator.status(id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => job_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let reason = body.reason.unwrap_or_else(|| "cancelled by operator".into());
    match state.orchestrator.cancel(id, &reason).await {
        Ok(()) => Json(json!({ "job_id": id, "status": "cancelled" })).into_response(),
        Err(e) => job_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    note: Option<String>,
}

async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let note = body.note.unwrap_or_else(|| "resumed by operator".into());
    match state.orchestrator.resume(id, &note).await {
        Ok(()) => Json(json!({ "job_id": id, "status": "resumed" })).into_response(),
        Err(e) => job_error(e),
    }
}

// ── Manual sends ────────────────────────────────────────────────────

async fn confirm_manual(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.router.confirm_manual(id).await {
        Ok(approval) => Json(approval).into_response(),
        Err(e) => error(store_status(&e), e),
    }
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    reason: String,
}

async fn fail_manual(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FailRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.router.fail_manual(id, &body.reason).await {
        Ok(approval) => Json(approval).into_response(),
        Err(e) => error(store_status(&e), e),
    }
}

// ── Drain trigger ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct DrainParams {
    max_batch: Option<usize>,
}

/// One router invocation, for an external scheduler.
async fn drain(State(state): State<AppState>, Query(params): Query<DrainParams>) -> Response {
    let max_batch = params
        .max_batch
        .unwrap_or(state.router.config().default_batch);

    let report = match state.router.process_approved(max_batch).await {
        Ok(report) => report,
        Err(e) if e.is_storage_unavailable() => {
            warn!("Drain aborted: {e}");
            return error(StatusCode::SERVICE_UNAVAILABLE, e);
        }
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let reconciled = match state.router.reconcile_opened().await {
        Ok(n) => n,
        Err(e) => {
            warn!("Reconciliation of opened approvals failed: {e}");
            0
        }
    };
    info!(max_batch, reconciled, "Drain complete");
    Json(json!({ "report": report, "reconciled": reconciled })).into_response()
}
