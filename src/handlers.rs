/// Axum handlers for the control surface
use crate::AppState;
use crate::allocation::AllocationRequest;
use crate::catalog::ModelKey;
use crate::errors::AllocationError;
use crate::views::{
    GrantResponse, ListModelResponse, PinRequest, ReleaseResponse, StatusResponse,
};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::Stream;
use serde_json::json;
use std::convert::Infallible;
use tokio::time::Instant;
use tokio_stream::{StreamExt as _, wrappers::BroadcastStream};
use tracing::{debug, instrument, warn};

/// Ask for a model. Malformed bodies are reported like any other invalid request.
#[instrument(skip(state, body))]
pub async fn allocate(
    State(state): State<AppState>,
    body: Result<Json<AllocationRequest>, JsonRejection>,
) -> Result<Json<GrantResponse>, AllocationError> {
    let Json(request) = body.map_err(|e| AllocationError::InvalidRequest(e.body_text()))?;
    debug!(requester = %request.requester_id, "Allocation request");
    let grant = state.allocator.allocate(request).await?;
    Ok(Json(GrantResponse::from_grant(grant, Instant::now())))
}

#[instrument(skip(state))]
pub async fn release(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
) -> Json<ReleaseResponse> {
    Json(ReleaseResponse {
        released: state.allocator.release(&requester_id).await,
    })
}

#[instrument(skip(state))]
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.allocator.status().await.into())
}

#[instrument(skip(state))]
pub async fn models(State(state): State<AppState>) -> Json<ListModelResponse> {
    let catalog = state.allocator.catalog().await;
    Json(ListModelResponse::from_catalog(&catalog, Instant::now()))
}

#[instrument(skip(state, body))]
pub async fn set_pin(
    State(state): State<AppState>,
    body: Result<Json<PinRequest>, JsonRejection>,
) -> Result<Response, AllocationError> {
    let Json(pin) = body.map_err(|e| AllocationError::InvalidRequest(e.body_text()))?;
    let key = ModelKey::new(pin.provider.clone(), pin.model_id.clone());
    if state.allocator.set_pinned(&key, pin.pinned).await {
        Ok(Json(pin).into_response())
    } else {
        let body = json!({
            "error": {
                "type": "not_found",
                "message": format!("unknown model {key}"),
            }
        });
        Ok((StatusCode::NOT_FOUND, Json(body)).into_response())
    }
}

/// Stream engine events as server-sent events. Subscribers that fall behind skip ahead.
#[instrument(skip(state))]
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.allocator.subscribe()).filter_map(|message| {
        match message {
            Ok(event) => match Event::default().json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    warn!(error = %e, "Failed to encode engine event");
                    None
                }
            },
            Err(e) => {
                debug!(error = %e, "Event subscriber lagged");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
