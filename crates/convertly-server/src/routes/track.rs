use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use convertly_core::event::TrackEventRequest;

use crate::{error::AppError, state::AppState};

/// `POST /api/track`: ingest one event.
///
/// The beacon's own `User-Agent` header is used for device detection when
/// the payload carries neither `device_type` nor `user_agent`.
#[tracing::instrument(skip(state, headers, body))]
pub async fn track_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let mut req: TrackEventRequest =
        serde_json::from_value(body).map_err(|e| AppError::InvalidEvent(e.to_string()))?;
    if req.user_agent.is_none() {
        req.user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let event = state.engine.track_event(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": event }))))
}
