//! HTTP adapter over [`SchedulerHandle`].
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/api/resources` | resources with occupancy and telemetry |
//! | GET, POST | `/api/jobs` | list / submit |
//! | GET | `/api/jobs/{id}` | one job |
//! | POST | `/api/jobs/{id}/cancel` | cancel, resolves once the job is terminal |
//! | GET | `/api/jobs/{id}/events` | server-sent events |
//! | GET | `/api/jobs/{id}/logs` | durable log text |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::inventory::ResourceId;
use crate::publisher::JobEvent;
use crate::scheduler::{JobSpec, JobStatus, SchedulerHandle};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: SchedulerHandle,
    /// Ends open event streams when the server shuts down
    pub shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    name: String,
    resource: String,
    image: String,
    workspace: PathBuf,
    output_dir: PathBuf,
    #[serde(default)]
    command: Option<Vec<String>>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
    status: JobStatus,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps scheduler errors onto HTTP status codes.
pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedulerError::InvalidResource(_) | SchedulerError::InvalidSpec(_) => {
                StatusCode::BAD_REQUEST
            }
            SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
            SchedulerError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/resources", get(list_resources_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .route("/api/jobs/{id}/events", get(job_events_handler))
        .route("/api/jobs/{id}/logs", get(job_logs_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn list_resources_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let resources = state.scheduler.list_resources().await?;
    Ok(Json(resources).into_response())
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let jobs = state.scheduler.list().await?;
    Ok(Json(jobs).into_response())
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<Response, ApiError> {
    let resource: ResourceId = payload
        .resource
        .parse()
        .map_err(SchedulerError::InvalidResource)?;

    let job = state
        .scheduler
        .submit(JobSpec {
            name: payload.name,
            resource,
            image: payload.image,
            workspace: payload.workspace,
            output_dir: payload.output_dir,
            command: payload.command,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    )
        .into_response())
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.scheduler.get(id).await?;
    Ok(Json(job).into_response())
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.scheduler.cancel(id).await?;
    Ok(Json(job).into_response())
}

async fn job_logs_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let text = state.scheduler.read_log(id).await?;
    Ok(text.into_response())
}

fn sse_event(event: &JobEvent) -> Event {
    let kind = match event {
        JobEvent::Status(_) => "status",
        JobEvent::Log(_) => "log",
        JobEvent::Telemetry(_) => "telemetry",
    };
    match Event::default().event(kind).json_data(event) {
        Ok(event) => event,
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

async fn job_events_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.scheduler.subscribe(id).await?;

    // A "lagged" event carrying the running total precedes the first event
    // delivered after a gap.
    let events = futures::stream::unfold((subscription, 0u64), |(mut sub, reported)| async move {
        let event = sub.next().await?;
        let dropped = sub.dropped();
        let mut out = Vec::with_capacity(2);
        if dropped > reported {
            out.push(Event::default().event("lagged").data(dropped.to_string()));
        }
        out.push(sse_event(&event));
        Some((futures::stream::iter(out), (sub, dropped)))
    })
    .flatten()
    .map(Ok)
    .take_until(state.shutdown.cancelled_owned());

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
