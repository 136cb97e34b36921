use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::core::errors::ApiError;
use crate::sources::{self, SourceDescriptor};

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub source: SourceDescriptor,
    #[serde(default = "default_rows")]
    pub rows: usize,
}

fn default_rows() -> usize {
    10
}

/// Connects to a source and returns a sample with inferred field kinds.
pub async fn preview_source(
    Json(request): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let preview = sources::preview(&request.source, request.rows).await?;
    Ok(Json(preview))
}
