//! Admission queue endpoints, including the server-sent status stream.

use std::sync::Arc;
use std::time::Duration;

use admission::{EntryStatusView, QueueKey, QueueSettings};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use super::Actor;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ActivateRequest {
    pub max_capacity: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
}

/// POST /queue/{type}/{id}/activate
#[tracing::instrument(skip(state, req))]
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path((event_type, event_id)): Path<(String, i64)>,
    Json(req): Json<ActivateRequest>,
) -> Result<StatusCode, ApiError> {
    let settings = QueueSettings {
        max_capacity: req.max_capacity,
        batch_size: req.batch_size,
        batch_interval: Duration::from_millis(req.batch_interval_ms),
    };
    state
        .admission
        .activate(QueueKey::new(event_type, event_id), settings)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/{type}/{id}/deactivate
pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    Path((event_type, event_id)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    state
        .admission
        .deactivate(&QueueKey::new(event_type, event_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /queue/{type}/{id}/enter
pub async fn enter(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path((event_type, event_id)): Path<(String, i64)>,
) -> Result<Json<EntryStatusView>, ApiError> {
    let view = state
        .admission
        .enter(&QueueKey::new(event_type, event_id), &actor)
        .await?;
    Ok(Json(view))
}

/// GET /queue/status/{token}
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<EntryStatusView>, ApiError> {
    Ok(Json(state.admission.status(&token).await?))
}

/// DELETE /queue/{token}
pub async fn leave(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<EntryStatusView>, ApiError> {
    Ok(Json(state.admission.leave(&token).await?))
}

/// POST /queue/{token}/complete: give back an admitted slot.
pub async fn complete(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.admission.complete(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /queue/subscribe/{token}: status pushes as server-sent events.
///
/// Each event is named `status` and carries the entry's status view.
/// The stream ends once the entry stops waiting.
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let subscription = state.admission.subscribe(&token).await?;
    let events = subscription.map(|view| Event::default().event("status").json_data(view));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
