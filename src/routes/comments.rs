//! Comment export endpoints (/fetch-comments, /estimate, /jobs/*)

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::AppState;
use crate::estimate::estimate_wait_secs;
use crate::jobs::MaterializeJob;
use crate::materialize::refresh_links;
use crate::models::{ExportFormat, JobStatus, MaterializationJob};
use crate::services::error::AppError;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/fetch-comments", post(fetch_comments))
        .route("/estimate", post(estimate))
        .route("/jobs/{video_id}", get(get_job))
}

#[derive(Debug, Deserialize)]
pub struct FetchCommentsRequest {
    pub video_id: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CachedVideo {
    pub video_id: String,
    pub download_links: BTreeMap<ExportFormat, String>,
    pub total_comments: i64,
    pub expiry_time: i64,
}

/// Result of the synchronous eligibility + cache lookup
#[derive(Debug)]
pub enum Lookup {
    NoCredits,
    Cached { video: CachedVideo, credits: i64 },
    /// A job is pending or running; `dispatched` is true if this request started it
    InProgress {
        status: JobStatus,
        dispatched: bool,
        wait_for: Option<f64>,
    },
}

#[derive(Serialize)]
struct CachedResponse {
    #[serde(rename = "Query")]
    query: &'static str,
    response: CachedVideo,
    credits: i64,
}

#[derive(Serialize)]
struct InProgressResponse {
    status: JobStatus,
    wait_for: Option<f64>,
    message: &'static str,
}

impl IntoResponse for Lookup {
    fn into_response(self) -> Response {
        match self {
            Lookup::NoCredits => {
                (StatusCode::OK, Json(serde_json::json!({ "credits": 0 }))).into_response()
            }
            Lookup::Cached { video, credits } => (
                StatusCode::OK,
                Json(CachedResponse {
                    query: "success",
                    response: video,
                    credits,
                }),
            )
                .into_response(),
            Lookup::InProgress {
                status,
                dispatched,
                wait_for,
            } => {
                let message = if dispatched {
                    "Export started, poll again after wait_for seconds"
                } else {
                    "Export already in progress"
                };
                (
                    StatusCode::ACCEPTED,
                    Json(InProgressResponse {
                        status,
                        wait_for,
                        message,
                    }),
                )
                    .into_response()
            }
        }
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(format!("Missing {}", field)))
}

/// POST /fetch-comments - Serve cached exports or start materializing them
async fn fetch_comments(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchCommentsRequest>,
) -> Result<Lookup, AppError> {
    let video_id = required(req.video_id, "video_id")?;
    let email = required(req.email, "email")?;

    lookup(&state, &video_id, &email).await
}

pub async fn lookup(state: &AppState, video_id: &str, email: &str) -> Result<Lookup, AppError> {
    let user = state
        .metadata
        .get_user(email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    if user.credits == 0 {
        return Ok(Lookup::NoCredits);
    }

    if let Some(entry) = state.metadata.get_video(video_id).await? {
        if !entry.is_expired(Utc::now()) {
            let download_links = refresh_links(state.artifacts.as_ref(), &entry).await?;
            return Ok(Lookup::Cached {
                video: CachedVideo {
                    video_id: entry.video_id,
                    download_links,
                    total_comments: entry.total_comments,
                    expiry_time: entry.expiry_time,
                },
                credits: user.credits,
            });
        }
    }

    let owned = state
        .metadata
        .enqueue_job(video_id, email, state.job_lease_seconds)
        .await?;

    let status = if let Some(attempt) = owned {
        let job = MaterializeJob {
            video_id: video_id.to_string(),
            email: email.to_string(),
        };
        if let Err(e) = state.dispatcher.dispatch(job).await {
            let message = e.to_string();
            state
                .metadata
                .finish_job(video_id, attempt, JobStatus::Failed, Some(&message))
                .await?;
            return Err(e);
        }
        tracing::info!(video_id, email, "materialization dispatched");
        JobStatus::Pending
    } else {
        state
            .metadata
            .get_job(video_id)
            .await?
            .map(|job| job.status)
            .filter(|s| s.is_active())
            .unwrap_or(JobStatus::Pending)
    };

    // Advisory only; a failed estimate never blocks the dispatched job
    let wait_for = match estimate_wait_secs(state.comments.as_ref(), video_id).await {
        Ok(secs) => Some(secs),
        Err(e) => {
            tracing::warn!(video_id, error = %e, "wait estimate unavailable");
            None
        }
    };

    Ok(Lookup::InProgress {
        status,
        dispatched: owned.is_some(),
        wait_for,
    })
}

#[derive(Debug, Deserialize)]
struct EstimateRequest {
    video_id: Option<String>,
}

#[derive(Serialize)]
struct EstimateResponse {
    video_id: String,
    wait_for: f64,
}

/// POST /estimate - Wait estimate without starting anything
async fn estimate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EstimateRequest>,
) -> Result<Json<EstimateResponse>, AppError> {
    let video_id = required(req.video_id, "video_id")?;
    let wait_for = estimate_wait_secs(state.comments.as_ref(), &video_id).await?;

    Ok(Json(EstimateResponse { video_id, wait_for }))
}

/// GET /jobs/:video_id - Poll a materialization job
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(video_id): Path<String>,
) -> Result<Json<MaterializationJob>, AppError> {
    state
        .metadata
        .get_job(&video_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))
}
