use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::{Result, RunnerError, SchedulerError};
use crate::pipeline::{JobRequest, Pipeline};
use crate::scheduler::job::{format_elapsed, ArtifactSource};
use crate::scheduler::{Activity, CancelOutcome, InputArtifact, Job, JobState};

#[derive(Clone)]
pub struct DashboardState {
    pub pipeline: Arc<Pipeline>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub activity: Activity,
    pub backlog: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub state: JobState,
    pub working_directory: String,
    pub exit_outcome: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Option<String>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            author: job.author.clone(),
            state: job.state,
            working_directory: job.working_directory.display().to_string(),
            exit_outcome: job.exit_outcome,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            elapsed: job.elapsed().map(format_elapsed),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputReference {
    /// Defaults to the last path segment of `source`.
    #[serde(default)]
    pub filename: Option<String>,
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub author: String,
    pub inputs: Vec<InputReference>,
}

impl SubmitJobRequest {
    async fn into_job_request(self, upload_root: Option<&std::path::Path>) -> Result<JobRequest> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input in self.inputs {
            let mut artifact = InputArtifact::from_reference(&input.source);
            if let ArtifactSource::Path(path) = &artifact.source {
                artifact.source = ArtifactSource::Path(confine(path, upload_root).await?);
            }
            if let Some(filename) = input.filename.filter(|f| !f.is_empty()) {
                artifact.filename = filename;
            }
            inputs.push(artifact);
        }
        Ok(JobRequest {
            author: self.author,
            inputs,
        })
    }
}

/// Resolve a submitted local path and require it to lie inside `root`.
async fn confine(path: &std::path::Path, root: Option<&std::path::Path>) -> Result<PathBuf> {
    let not_allowed = || RunnerError::SourceNotAllowed(path.display().to_string());
    let root = root.ok_or_else(not_allowed)?;
    let root = tokio::fs::canonicalize(root).await.map_err(|_| not_allowed())?;
    let resolved = tokio::fs::canonicalize(path).await.map_err(|_| not_allowed())?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(not_allowed())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub success: bool,
    pub job_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub success: bool,
    /// `"removed"` for a queued job, `"signalled"` for a running one.
    pub outcome: Option<String>,
    pub error: Option<String>,
}

/// HTTP intake and status routes.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/activity", get(activity_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting HTTP intake");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP intake");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP intake failed");
    }
}

async fn activity_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let scheduler = state.pipeline.scheduler();
    Json(ActivityResponse {
        activity: scheduler.activity().await,
        backlog: scheduler.backlog_len().await,
    })
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .pipeline
        .jobs()
        .await
        .iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.pipeline.job(&id).await {
        Some(job) => Ok(Json(JobResponse::from(&job))),
        None => Err((StatusCode::NOT_FOUND, format!("Job not found: {}", id))),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let upload_root = state.pipeline.config().upload_root.clone();
    let request = match payload.into_job_request(upload_root.as_deref()).await {
        Ok(request) => state.pipeline.submit(request).await,
        Err(e) => Err(e),
    };
    match request {
        Ok(submitted) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(submitted.job_id.to_string()),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                RunnerError::AdmissionRejected => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(SubmitJobResponse {
                    success: false,
                    job_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.pipeline.cancel(id).await {
        Ok(outcome) => {
            let outcome = match outcome {
                CancelOutcome::Removed => "removed",
                CancelOutcome::Running => "signalled",
            };
            (
                StatusCode::OK,
                Json(CancelJobResponse {
                    success: true,
                    outcome: Some(outcome.to_string()),
                    error: None,
                }),
            )
        }
        Err(e) => {
            let status = match e {
                SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::CONFLICT,
            };
            (
                status,
                Json(CancelJobResponse {
                    success: false,
                    outcome: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
