use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::ingest::FieldMapping;
use crate::sources::SourceDescriptor;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub source: SourceDescriptor,
    pub mapping: FieldMapping,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub limit: Option<usize>,
}

pub async fn start_ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.ingest.start(request.source, request.mapping)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job.job_id, "status": job.status })),
    ))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> impl IntoResponse {
    let jobs = state.ingest.recent(query.limit.unwrap_or(20));
    Json(json!({ "jobs": jobs }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .ingest
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("ingestion job {}", job_id)))
}
