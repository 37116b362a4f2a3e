use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// CORS is open unless `CONVERTLY_CORS_ORIGINS` lists the allowed origins;
/// the tracking beacon is posted from customer sites.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/api/funnels",
            post(routes::funnels::create_funnel).get(routes::funnels::list_funnels),
        )
        .route(
            "/api/funnels/{id}",
            get(routes::funnels::get_funnel).delete(routes::funnels::delete_funnel),
        )
        .route("/api/funnels/{id}/status", put(routes::funnels::set_funnel_status))
        .route("/api/funnels/{id}/analytics", get(routes::analytics::funnel_analytics))
        .route("/api/funnels/{id}/paths", get(routes::analytics::conversion_paths))
        .route(
            "/api/funnels/{id}/attribution/compare",
            post(routes::analytics::compare_models),
        )
        .route("/api/track", post(routes::track::track_event))
        .route("/api/sessions/{id}", get(routes::sessions::get_session))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
