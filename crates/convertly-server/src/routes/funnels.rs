use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use convertly_core::funnel::{CreateFunnelRequest, FunnelStatus};

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ListFunnelsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

/// `POST /api/funnels`: create a funnel with its steps, goals and models.
///
/// Malformed bodies are reported as validation errors on `body` rather than
/// the extractor's plain-text rejection.
#[tracing::instrument(skip(state, body))]
pub async fn create_funnel(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let req: CreateFunnelRequest =
        serde_json::from_value(body).map_err(|e| AppError::validation("body", e.to_string()))?;
    let funnel = state.engine.create_funnel(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": funnel }))))
}

/// `GET /api/funnels?user_id=`: funnels owned by one user, newest first.
#[tracing::instrument(skip(state))]
pub async fn list_funnels(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListFunnelsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = query
        .user_id
        .ok_or_else(|| AppError::validation("user_id", "user_id is required"))?;
    let funnels = state.engine.list_funnels(&user_id).await?;
    Ok(Json(json!({ "data": funnels })))
}

#[tracing::instrument(skip(state))]
pub async fn get_funnel(
    State(state): State<Arc<AppState>>,
    Path(funnel_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let funnel = state.engine.get_funnel(&funnel_id).await?;
    Ok(Json(json!({ "data": funnel })))
}

/// `PUT /api/funnels/{id}/status`: activate, pause or archive.
#[tracing::instrument(skip(state, body))]
pub async fn set_funnel_status(
    State(state): State<Arc<AppState>>,
    Path(funnel_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, AppError> {
    let status = FunnelStatus::parse(&body.status).ok_or_else(|| {
        AppError::validation("status", "status must be one of active, paused, archived")
    })?;
    let funnel = state.engine.set_funnel_status(&funnel_id, status).await?;
    Ok(Json(json!({ "data": funnel })))
}

/// `DELETE /api/funnels/{id}`: removes the funnel with its sessions and events.
#[tracing::instrument(skip(state))]
pub async fn delete_funnel(
    State(state): State<Arc<AppState>>,
    Path(funnel_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.engine.delete_funnel(&funnel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
