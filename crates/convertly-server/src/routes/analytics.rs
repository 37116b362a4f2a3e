use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use convertly_core::store::TimeRange;

use crate::{
    engine::reports::{CompareModelsRequest, LabeledModel},
    error::AppError,
    state::AppState,
};

const DEFAULT_RANGE_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PathsQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub min_frequency: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompareBody {
    #[serde(default)]
    pub models: Vec<LabeledModel>,
    pub baseline: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("invalid {field} (expected YYYY-MM-DD)")))
}

/// No dates means all time. A single date is completed with the default
/// window (the 30 days ending today).
fn parse_date_range(
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> Result<Option<TimeRange>, AppError> {
    if start_date.is_none() && end_date.is_none() {
        return Ok(None);
    }
    let today = chrono::Utc::now().date_naive();
    let start = match start_date {
        Some(raw) => parse_date("start_date", raw)?,
        None => today - chrono::Duration::days(DEFAULT_RANGE_DAYS - 1),
    };
    let end = match end_date {
        Some(raw) => parse_date("end_date", raw)?,
        None => today,
    };
    if end < start {
        return Err(AppError::BadRequest(
            "end_date must be on or after start_date".to_string(),
        ));
    }
    TimeRange::from_dates(start, end)
        .map(Some)
        .ok_or_else(|| AppError::BadRequest("date range out of bounds".to_string()))
}

/// `GET /api/funnels/{id}/analytics`: conversion rate, steps, drop-offs and
/// attribution breakdowns. `meta.stale` is set when the store was unreachable
/// and the last good snapshot was served instead.
#[tracing::instrument(skip(state))]
pub async fn funnel_analytics(
    State(state): State<Arc<AppState>>,
    Path(funnel_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<impl IntoResponse, AppError> {
    let range = parse_date_range(query.start_date.as_deref(), query.end_date.as_deref())?;
    let snapshot = state.engine.funnel_analytics(&funnel_id, range).await?;
    Ok(Json(json!({
        "data": snapshot.analytics,
        "meta": {
            "computed_at": snapshot.computed_at,
            "stale": snapshot.stale
        }
    })))
}

#[tracing::instrument(skip(state))]
pub async fn conversion_paths(
    State(state): State<Arc<AppState>>,
    Path(funnel_id): Path<String>,
    Query(query): Query<PathsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let range = parse_date_range(query.start_date.as_deref(), query.end_date.as_deref())?;
    let min_frequency = query.min_frequency.unwrap_or(1);
    let patterns = state
        .engine
        .analyze_conversion_paths(&funnel_id, range, min_frequency)
        .await?;
    Ok(Json(json!({ "data": patterns })))
}

/// `POST /api/funnels/{id}/attribution/compare`
#[tracing::instrument(skip(state, body))]
pub async fn compare_models(
    State(state): State<Arc<AppState>>,
    Path(funnel_id): Path<String>,
    Json(body): Json<CompareBody>,
) -> Result<impl IntoResponse, AppError> {
    let range = parse_date_range(body.start_date.as_deref(), body.end_date.as_deref())?;
    let request = CompareModelsRequest {
        models: body.models,
        baseline: body.baseline,
    };
    let report = state
        .engine
        .compare_attribution_models(&funnel_id, request, range)
        .await?;
    Ok(Json(json!({ "data": report })))
}
