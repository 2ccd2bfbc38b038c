//! Memory and corpus admin endpoints.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::ServiceResult;
use crate::AppState;

/// Memory inspection routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/memory/stats", get(memory_stats))
        .route("/api/memory/tools", get(recent_tools))
        .route("/api/memory/texts", get(recent_texts))
        .route("/api/memory/rag-high-score", get(rag_high_score))
        .route("/api/memory/rag-stats", get(rag_stats))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn memory_stats(State(state): State<AppState>) -> ServiceResult<Json<serde_json::Value>> {
    let stats = state.memory.stats().await?;
    Ok(Json(serde_json::json!({ "stats": stats })))
}

async fn recent_tools(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ServiceResult<Json<serde_json::Value>> {
    let tools = state.memory.recent_tools(query.limit).await?;
    Ok(Json(serde_json::json!({ "tools": tools })))
}

async fn recent_texts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ServiceResult<Json<serde_json::Value>> {
    let texts = state.memory.recent_texts(query.limit).await?;
    Ok(Json(serde_json::json!({ "texts": texts })))
}

#[derive(Debug, Deserialize)]
struct HighScoreQuery {
    #[serde(default = "default_high_score_limit")]
    limit: usize,
    #[serde(default = "default_min_score")]
    min_score: f64,
}

fn default_high_score_limit() -> usize {
    100
}

fn default_min_score() -> f64 {
    4.0
}

async fn rag_high_score(
    State(state): State<AppState>,
    Query(query): Query<HighScoreQuery>,
) -> ServiceResult<Json<serde_json::Value>> {
    let pairs = state.rag.high_score(query.limit, query.min_score).await?;
    Ok(Json(serde_json::json!({ "pairs": pairs })))
}

async fn rag_stats(State(state): State<AppState>) -> ServiceResult<Json<serde_json::Value>> {
    let stats = state.rag.stats().await?;
    Ok(Json(serde_json::json!({ "stats": stats })))
}
