use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::core::errors::ApiError;
use crate::rag::{AnswerRequest, AnswerResponse, StreamEvent};
use crate::state::AppState;

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let response = state.orchestrator.answer(request).await?;
    Ok(Json(response))
}

/// Streams the answer as Server-Sent Events named after the event type.
/// Closing the connection drops the receiver, which cancels generation.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnswerRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.orchestrator.answer_stream(request).await?;
    let stream = ReceiverStream::new(events).map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(serde_json::to_string(event).unwrap_or_default())
}
