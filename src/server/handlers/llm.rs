use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::llm::ProviderConfig;
use crate::state::AppState;

pub async fn list_providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "providers": state.gateway.providers(),
        "current": state.gateway.current_info(),
    }))
}

pub async fn current_provider(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.current_info())
}

/// Validates the configuration and swaps the active provider. The previous
/// provider stays active when validation fails.
pub async fn switch_provider(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ProviderConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.gateway.switch(config)?;
    Ok(Json(json!({ "status": "switched", "provider": info })))
}
