use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use mediasoup::prelude::RtpCapabilitiesFinalized;

use crate::errors::AppError;
use crate::events::StreamInfo;
use crate::media::egress::PlainTransportView;
use crate::ws::messages::MAX_ENTITY_ID_CHARS;
use crate::AppState;

/// Read-only serializations of registry and egress state. Nothing here
/// mutates.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/capabilities", get(get_capabilities))
        .route("/streams", get(list_streams))
        .route("/streams/{id}", get(get_stream))
        .route("/plain-transports", get(list_plain_transports))
}

async fn get_capabilities(
    State(state): State<AppState>,
) -> Result<Json<RtpCapabilitiesFinalized>, AppError> {
    state
        .media
        .rtp_capabilities()
        .map(Json)
        .map_err(|_| AppError::Internal("Media router is not initialized".into()))
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamInfo>> {
    Json(state.registry.active_streams())
}

async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StreamInfo>, AppError> {
    if id.is_empty() || id.len() > MAX_ENTITY_ID_CHARS {
        return Err(AppError::BadRequest("Invalid stream id".into()));
    }

    state
        .registry
        .stream(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Stream {id} not found")))
}

async fn list_plain_transports(State(state): State<AppState>) -> Json<Vec<PlainTransportView>> {
    Json(state.media.plain_transport_views().await)
}
