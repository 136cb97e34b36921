use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let turns = state.history.get_recent(&user_id, limit).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "count": turns.len(),
        "turns": turns,
    })))
}

pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.history.clear(&user_id).await?;
    tracing::info!(user_id = %user_id, deleted, "Conversation history cleared");
    Ok(Json(json!({
        "user_id": user_id,
        "deleted": deleted,
    })))
}
