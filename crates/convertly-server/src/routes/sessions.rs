use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{error::AppError, state::AppState};

/// `GET /api/sessions/{id}`: a visitor session with its touchpoints.
#[tracing::instrument(skip(state))]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.engine.get_session(&session_id).await?;
    Ok(Json(json!({ "data": session })))
}
