//! Operational HTTP surface.
//!
//! Liveness/readiness probes, read-only views of the active job set, timers
//! and event log, and a fire-and-forget discovery trigger.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::collector::{IntervalScheduler, JobRegistry};
use crate::discovery::parse_bounded;
use crate::engine::{EngineError, EngineHandle};
use crate::model::{DiscoveryId, JobId, ProvisionId, SystemType};
use crate::storage::StorageHandles;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageHandles,
    pub engine: EngineHandle,
    pub registry: Arc<JobRegistry>,
    pub scheduler: Arc<IntervalScheduler>,
    /// Expansion limit applied when validating a discovery trigger.
    pub max_hosts: u64,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Active job, without credential secrets.
#[derive(Serialize)]
struct JobView {
    id: JobId,
    provision_id: ProvisionId,
    metric: String,
    address: String,
    port: u16,
    username: String,
    system_type: SystemType,
    interval_secs: u64,
}

#[derive(Serialize)]
struct IntervalView {
    interval_secs: u64,
    every: String,
    devices: usize,
    jobs: usize,
    timer: bool,
}

#[derive(Serialize)]
struct TriggerResponse {
    discovery_id: DiscoveryId,
    status: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Query parameters for events API.
#[derive(Debug, Deserialize)]
pub struct EventsQueryParams {
    pub source: Option<String>,
    pub limit: Option<u32>,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/intervals", get(intervals_handler))
        .route("/api/events", get(events_handler))
        .route("/api/discoveries/{id}/run", post(run_discovery_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that round-trips to the database.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// Registry snapshot.
async fn jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    let jobs = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|job| JobView {
            id: job.id,
            provision_id: job.parent_id,
            metric: job.metric,
            address: job.target.address,
            port: job.target.port,
            username: job.credential.username,
            system_type: job.credential.system_type,
            interval_secs: job.interval_secs,
        })
        .collect();
    Json(jobs)
}

/// Interval groups and whether each currently owns a timer.
async fn intervals_handler(State(state): State<Arc<AppState>>) -> Json<Vec<IntervalView>> {
    let timers = state.scheduler.active_intervals().await;
    let groups = state
        .registry
        .groups()
        .await
        .into_iter()
        .map(|g| IntervalView {
            interval_secs: g.interval_secs,
            every: humantime::format_duration(Duration::from_secs(g.interval_secs)).to_string(),
            devices: g.devices.len(),
            jobs: g.job_count(),
            timer: timers.contains(&g.interval_secs),
        })
        .collect();
    Json(groups)
}

/// Recent events, newest first.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQueryParams>,
) -> Response {
    let source = params.source.as_deref().filter(|s| !s.is_empty());
    match state.storage.events.recent(source, params.limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Queue a discovery run. Returns before probing starts.
///
/// A malformed or oversized address expression is rejected here, before the
/// attempt changes state.
async fn run_discovery_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DiscoveryId>,
) -> Response {
    let record = match state.storage.discoveries.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("discovery {id} not found"));
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    if let Err(e) = parse_bounded(&record.address, state.max_hosts) {
        return error_response(StatusCode::BAD_REQUEST, e);
    }

    match state.engine.run_discovery(id) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                discovery_id: id,
                status: "accepted",
            }),
        )
            .into_response(),
        Err(e @ (EngineError::TriggerFull(_) | EngineError::TriggerClosed(_))) => {
            tracing::warn!(discovery_id = id, error = %e, "Discovery trigger rejected");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
