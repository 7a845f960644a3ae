//! HTTP API over the engine handle
//!
//! JSON endpoints for enqueueing, reading and cancelling jobs, plus a
//! Server-Sent Events tail of a job's event feed that resumes from
//! `after_id` or the `Last-Event-ID` header.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::EngineHandle;
use crate::errors::{AppError, AppResult};
use crate::feed::FeedItem;
use crate::jobs::JobStatus;
use crate::models::{
    EngineStatusView, EnqueueMutationInput, EnqueueSyncInput, EnqueuedJob, JobListData, JobView,
    default_list_limit,
};
use crate::mutation::MutationParams;

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ApiErrorBody>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(e: AppError) -> ApiError {
    let status = match &e {
        AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Conflict(_) | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
        AppError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::AuthFailed(_) | AppError::Protocol(_) => StatusCode::BAD_GATEWAY,
        AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "request failed");
    }
    (
        status,
        Json(ApiErrorBody {
            error: e.to_string(),
            code: e.code().to_owned(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    after_id: Option<i64>,
}

/// Routes for the job API
pub fn router(handle: EngineHandle) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/sync", post(enqueue_sync))
        .route("/jobs/mutation", post(enqueue_mutation))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/events", get(job_events))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/status", get(engine_status))
        .with_state(handle)
}

/// Serve the API on `addr` until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    handle: EngineHandle,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Internal(format!("HTTP server failed: {e}")))
}

async fn enqueue_sync(
    State(handle): State<EngineHandle>,
    Json(input): Json<EnqueueSyncInput>,
) -> ApiResult<(StatusCode, Json<EnqueuedJob>)> {
    let enqueued = handle
        .enqueue_sync(&input.folder, input.mode)
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedJob::from(&enqueued))))
}

async fn enqueue_mutation(
    State(handle): State<EngineHandle>,
    Json(input): Json<EnqueueMutationInput>,
) -> ApiResult<(StatusCode, Json<EnqueuedJob>)> {
    let params = MutationParams {
        folder: input.folder,
        uids: input.uids,
        mark_read: input.mark_read,
        move_to: input.move_to,
    };
    let job_id = handle.enqueue_mutation(&params).map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedJob {
            job_id,
            deduplicated: false,
        }),
    ))
}

async fn list_jobs(
    State(handle): State<EngineHandle>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<JobListData>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(api_error)?;
    let jobs = handle
        .list_jobs(status, query.limit.unwrap_or_else(default_list_limit))
        .map_err(api_error)?;
    Ok(Json(JobListData {
        jobs: jobs.iter().map(JobView::from).collect(),
    }))
}

async fn get_job(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = handle.get_job(&id).map_err(api_error)?;
    Ok(Json(JobView::from(&job)))
}

async fn cancel_job(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = handle.cancel(&id).map_err(api_error)?;
    Ok(Json(JobView::from(&job)))
}

async fn engine_status(State(handle): State<EngineHandle>) -> ApiResult<Json<EngineStatusView>> {
    let status = handle.status().map_err(api_error)?;
    Ok(Json(EngineStatusView::from(&status)))
}

async fn job_events(
    State(handle): State<EngineHandle>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let resume = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());
    let after_id = query.after_id.unwrap_or(0).max(resume.unwrap_or(0));
    let feed = handle.feed(&id, after_id).map_err(api_error)?;
    Ok(Sse::new(feed.map(|item| Ok::<_, Infallible>(sse_event(item)))))
}

fn sse_event(item: AppResult<FeedItem>) -> Event {
    match item {
        Ok(item) => {
            let event = Event::default().event(item.kind());
            let event = match item.event_id() {
                Some(id) => event.id(id.to_string()),
                None => event,
            };
            event
                .json_data(&item)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
        }
        Err(e) => Event::default()
            .event("error")
            .data(json!({ "code": e.code(), "error": e.to_string() }).to_string()),
    }
}
