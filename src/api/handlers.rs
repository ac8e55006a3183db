use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::run::{RecommendationItem, RecommendationRun, RunContext};
use crate::models::GeoPoint;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct TriggerRunRequest {
    pub user_id: Uuid,
    /// Optional geographic anchor; enables distance-aware scoring
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub run_type: String,
    pub cause: Option<String>,
    pub degraded_sources: Vec<String>,
    pub model_stale: bool,
}

impl From<&RecommendationRun> for RunResponse {
    fn from(run: &RecommendationRun) -> Self {
        Self {
            run_id: run.id,
            user_id: run.user_id,
            status: run.status.as_str().to_string(),
            run_type: match run.run_type {
                crate::models::run::RunType::Personal => "personal".to_string(),
                crate::models::run::RunType::Template => "template".to_string(),
            },
            cause: run.cause.clone(),
            degraded_sources: run.degraded_sources.clone(),
            model_stale: run.model_stale,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub items: Vec<RecommendationItem>,
}

/// POST /api/v1/runs
pub async fn trigger_run(
    State(state): State<AppState>,
    Json(payload): Json<TriggerRunRequest>,
) -> AppResult<(StatusCode, Json<RunResponse>)> {
    let ctx = RunContext {
        location: payload.location,
    };
    let run_id = state
        .orchestrator
        .run_user_feed(payload.user_id, ctx)
        .await?;
    let run = state.orchestrator.run(run_id).await?;
    Ok((StatusCode::CREATED, Json(RunResponse::from(&run))))
}

/// GET /api/v1/runs/:run_id
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> AppResult<Json<RunResponse>> {
    let run = state.orchestrator.run(run_id).await?;
    Ok(Json(RunResponse::from(&run)))
}

/// POST /api/v1/runs/:run_id/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> AppResult<Json<RunResponse>> {
    state.orchestrator.cancel_run(run_id).await?;
    let run = state.orchestrator.run(run_id).await?;
    Ok(Json(RunResponse::from(&run)))
}

/// GET /api/v1/users/:user_id/feed
pub async fn get_feed(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<FeedResponse>> {
    let items = state.orchestrator.get_feed(user_id).await?;
    Ok(Json(FeedResponse { items }))
}

#[derive(Debug, Serialize)]
pub struct RebuildResponse {
    pub user_id: Uuid,
    pub affinity_rows: usize,
}

/// POST /api/v1/users/:user_id/affinities/rebuild
pub async fn rebuild_affinities(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<RebuildResponse>> {
    let affinity_rows = state.orchestrator.rebuild_affinities(user_id).await?;
    Ok(Json(RebuildResponse {
        user_id,
        affinity_rows,
    }))
}

/// POST /api/v1/model/refresh
pub async fn refresh_model(State(state): State<AppState>) -> AppResult<StatusCode> {
    state.orchestrator.refresh_popularity_model().await?;
    Ok(StatusCode::ACCEPTED)
}
