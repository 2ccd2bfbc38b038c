//! Feedback endpoints.
//!
//! Votes and ratings are write-through: the current feedback row is
//! updated, the submission appends to history, and the learner is
//! notified with the merged ratings.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};
use crate::rag::learner::UserVote;
use crate::rag::Ratings;
use crate::AppState;

/// Feedback routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/feedback/{id}/vote", post(submit_vote))
        .route("/api/feedback/{id}/rate", post(submit_rating))
        .route("/api/feedback/{id}", get(get_feedback))
}

#[derive(Debug, Deserialize)]
struct VoteRequest {
    vote: UserVote,
}

#[derive(Debug, Deserialize)]
struct RateRequest {
    rating: f64,
    reviewer: Reviewer,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Reviewer {
    Expert,
    Llm,
}

/// `POST /api/feedback/{id}/vote` — user thumbs up or down.
async fn submit_vote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    ensure_conversation(&state, &id).await?;

    let merged = state
        .conversations
        .save_feedback(id.clone(), None, Some(request.vote), None)
        .await?;
    notify_learner(&state, &id).await;

    Ok(Json(serde_json::json!({ "feedback": merged })))
}

/// `POST /api/feedback/{id}/rate` — expert or LLM-judge rating.
async fn submit_rating(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RateRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    if !(1.0..=5.0).contains(&request.rating) {
        return Err(ServiceError::Validation("rating must be in 1..=5".into()));
    }
    ensure_conversation(&state, &id).await?;

    let (expert, llm) = match request.reviewer {
        Reviewer::Expert => (Some(request.rating.round() as u8), None),
        Reviewer::Llm => (None, Some(request.rating)),
    };
    let merged = state
        .conversations
        .save_feedback(id.clone(), expert, None, llm)
        .await?;
    notify_learner(&state, &id).await;

    Ok(Json(serde_json::json!({ "feedback": merged })))
}

/// `GET /api/feedback/{id}` — current feedback for a conversation.
async fn get_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    ensure_conversation(&state, &id).await?;
    let feedback = state.conversations.get_feedback(id).await?;
    Ok(Json(serde_json::json!({ "feedback": feedback })))
}

async fn ensure_conversation(state: &AppState, id: &str) -> ServiceResult<()> {
    state
        .conversations
        .get_conversation(id.to_string())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("conversation {}", id)))?;
    Ok(())
}

/// Hand the merged ratings to the learner. Learning failures never fail
/// the feedback request.
async fn notify_learner(state: &AppState, conversation_id: &str) {
    let inputs = match state
        .conversations
        .learner_inputs(conversation_id.to_string())
        .await
    {
        Ok(Some(inputs)) => inputs,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "learner input lookup failed");
            return;
        }
    };
    let feedback = match state
        .conversations
        .get_feedback(conversation_id.to_string())
        .await
    {
        Ok(feedback) => feedback,
        Err(e) => {
            tracing::warn!(error = %e, "feedback lookup failed");
            return;
        }
    };

    let (question, sql, answer) = inputs;
    let ratings = Ratings {
        expert: feedback.expert_rating,
        user_vote: feedback.user_vote,
        llm: feedback.llm_score,
    };
    let source = if feedback.expert_rating.is_some() {
        "expert"
    } else {
        "feedback"
    };

    match state
        .learner
        .learn(conversation_id, &question, sql.as_deref(), &answer, ratings, source)
        .await
    {
        Ok(outcome) => {
            tracing::info!(%conversation_id, ?outcome, "learner notified");
        }
        Err(e) => {
            tracing::warn!(error = %e, "learning from feedback failed");
        }
    }
}
