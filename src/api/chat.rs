//! Chat streaming and conversation endpoints.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ServiceError, ServiceResult};
use crate::events::ChatEvent;
use crate::orchestrator::{run_chat, ChatParams, EventSink};
use crate::AppState;

/// Chat routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/chat/conversations", get(list_conversations))
        .route(
            "/api/chat/conversation/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/chat/query-result/{file_hash}", get(query_result))
}

/// Chat stream request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    /// The user's question.
    pub message: String,
    /// Conversation to continue, or absent to start one.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Client-side history; accepted for compatibility, the durable
    /// transcript is authoritative.
    #[serde(default)]
    pub history: Option<Vec<serde_json::Value>>,
    /// User identifier.
    pub user_id: String,
    /// Optional display nickname.
    #[serde(default)]
    pub user_nickname: Option<String>,
}

/// `POST /api/chat/stream` — the streaming chat endpoint.
///
/// Responds with an event stream of `data: <json>` lines terminated by
/// the `data: [DONE]` sentinel.
async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatStreamRequest>,
) -> ServiceResult<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>> {
    if request.message.trim().is_empty() {
        return Err(ServiceError::Validation("message must not be empty".into()));
    }
    if request.user_id.trim().is_empty() {
        return Err(ServiceError::Validation("userId must not be empty".into()));
    }

    let (sink, rx) = EventSink::new(state.config.agent.channel_capacity);
    let params = ChatParams {
        conversation_id: request.conversation_id,
        message: request.message,
        user_id: request.user_id,
        user_nickname: request.user_nickname,
    };

    // Single producer per request; the SSE stream below is the single
    // reader. Dropping the response cancels the pipeline at the next
    // iteration boundary.
    tokio::spawn(run_chat(state, params, sink));

    let sse_stream = ReceiverStream::new(rx).map(|stream_event| {
        let event = match stream_event.event {
            ChatEvent::Done => Event::default().data("[DONE]"),
            other => match other.to_wire() {
                Some(wire) => Event::default().data(wire.to_string()),
                None => Event::default().data("{}"),
            },
        };
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

/// `GET /api/chat/conversations` — list conversations.
async fn list_conversations(
    State(state): State<AppState>,
) -> ServiceResult<Json<serde_json::Value>> {
    let conversations = state.conversations.list_conversations(100).await?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

/// `GET /api/chat/conversation/{id}` — a conversation with its messages.
async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    let conversation = state
        .conversations
        .get_conversation(id.clone())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("conversation {}", id)))?;
    let messages = state.conversations.load_transcript(id).await?;
    Ok(Json(serde_json::json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

/// `DELETE /api/chat/conversation/{id}` — delete a conversation.
async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    let deleted = state.conversations.delete_conversation(id.clone()).await?;
    if !deleted {
        return Err(ServiceError::NotFound(format!("conversation {}", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// `GET /api/chat/query-result/{file_hash}` — full rows of an artifact.
async fn query_result(
    State(state): State<AppState>,
    Path(file_hash): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    let output = state
        .artifacts
        .read(&file_hash)
        .map_err(|_| ServiceError::NotFound(format!("artifact {}", file_hash)))?;
    Ok(Json(serde_json::json!({
        "fileHash": file_hash,
        "columns": output.columns,
        "rows": output.rows,
    })))
}
