use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API routes under /api/v1
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/runs", post(handlers::trigger_run))
        .route("/runs/:run_id", get(handlers::get_run))
        .route("/runs/:run_id/cancel", post(handlers::cancel_run))
        .route("/users/:user_id/feed", get(handlers::get_feed))
        .route(
            "/users/:user_id/affinities/rebuild",
            post(handlers::rebuild_affinities),
        )
        .route("/model/refresh", post(handlers::refresh_model))
}

/// Health check endpoint
async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}
