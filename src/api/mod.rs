//! HTTP API endpoints.

pub mod chat;
pub mod feedback;
pub mod health;
pub mod knowledge;
pub mod memory;

use axum::Router;

use crate::AppState;

/// Create the API router with all endpoint groups.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(chat::router())
        .merge(feedback::router())
        .merge(knowledge::router())
        .merge(memory::router())
}
