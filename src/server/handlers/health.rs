use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Component status. A failing index is reported, not propagated.
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let index = match state.index.stats().await {
        Ok(stats) => json!(stats),
        Err(err) => {
            tracing::warn!("Index stats unavailable: {}", err);
            json!({ "error": err.to_body() })
        }
    };
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    Json(json!({
        "status": "ok",
        "started_at": state.started_at.to_rfc3339(),
        "uptime_secs": uptime_secs,
        "history_store": state.history.name(),
        "index": index,
        "llm": state.gateway.current_info(),
        "ingest_jobs": state.ingest.recent(5),
    }))
}
