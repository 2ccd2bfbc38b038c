//! Knowledge and prompt management endpoints.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};
use crate::knowledge::{BusinessTerm, FieldMapping, TermKind, TimeRule};
use crate::AppState;

/// Knowledge CRUD and prompt management routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/knowledge/time-rules",
            get(list_time_rules).post(upsert_time_rule),
        )
        .route("/api/knowledge/time-rules/{keyword}", delete(delete_time_rule))
        .route("/api/knowledge/terms", get(list_terms).post(upsert_term))
        .route("/api/knowledge/terms/{term}", delete(delete_term))
        .route(
            "/api/knowledge/field-mappings",
            get(list_mappings).post(upsert_mapping),
        )
        .route("/api/knowledge/field-mappings/{name}", delete(delete_mapping))
        .route("/api/prompt/list", get(list_prompts))
        .route("/api/prompt/create", post(create_prompt))
        .route("/api/prompt/activate", post(activate_prompt))
        .route("/api/prompt/{name}/{version}", delete(delete_prompt))
}

async fn list_time_rules(State(state): State<AppState>) -> ServiceResult<Json<serde_json::Value>> {
    let rules = state.knowledge.list_time_rules().await?;
    Ok(Json(serde_json::json!({ "timeRules": rules })))
}

#[derive(Debug, Deserialize)]
struct TimeRuleRequest {
    keyword: String,
    rule_type: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: i64,
}

async fn upsert_time_rule(
    State(state): State<AppState>,
    Json(request): Json<TimeRuleRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    if request.keyword.trim().is_empty() {
        return Err(ServiceError::Validation("keyword must not be empty".into()));
    }
    state
        .knowledge
        .upsert_time_rule(TimeRule {
            keyword: request.keyword,
            rule_type: request.rule_type,
            config: request.config,
            description: request.description,
            priority: request.priority,
        })
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn delete_time_rule(
    State(state): State<AppState>,
    Path(keyword): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    if !state.knowledge.delete_time_rule(keyword.clone()).await? {
        return Err(ServiceError::NotFound(format!("time rule {}", keyword)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn list_terms(State(state): State<AppState>) -> ServiceResult<Json<serde_json::Value>> {
    let terms = state.knowledge.list_terms().await?;
    Ok(Json(serde_json::json!({ "terms": terms })))
}

#[derive(Debug, Deserialize)]
struct TermRequest {
    term: String,
    kind: TermKind,
    definition: String,
    #[serde(default)]
    sql_expression: Option<String>,
    #[serde(default)]
    priority: i64,
}

async fn upsert_term(
    State(state): State<AppState>,
    Json(request): Json<TermRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    if request.term.trim().is_empty() {
        return Err(ServiceError::Validation("term must not be empty".into()));
    }
    state
        .knowledge
        .upsert_term(BusinessTerm {
            term: request.term,
            kind: request.kind,
            definition: request.definition,
            sql_expression: request.sql_expression,
            priority: request.priority,
        })
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn delete_term(
    State(state): State<AppState>,
    Path(term): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    if !state.knowledge.delete_term(term.clone()).await? {
        return Err(ServiceError::NotFound(format!("term {}", term)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn list_mappings(State(state): State<AppState>) -> ServiceResult<Json<serde_json::Value>> {
    let mappings = state.knowledge.list_mappings().await?;
    Ok(Json(serde_json::json!({ "fieldMappings": mappings })))
}

#[derive(Debug, Deserialize)]
struct MappingRequest {
    display_name: String,
    table_name: String,
    field_name: String,
    field_value: String,
    #[serde(default)]
    priority: i64,
}

async fn upsert_mapping(
    State(state): State<AppState>,
    Json(request): Json<MappingRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    if request.display_name.trim().is_empty() {
        return Err(ServiceError::Validation("display_name must not be empty".into()));
    }
    state
        .knowledge
        .upsert_mapping(FieldMapping {
            display_name: request.display_name,
            table_name: request.table_name,
            field_name: request.field_name,
            field_value: request.field_value,
            priority: request.priority,
        })
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn delete_mapping(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    if !state.knowledge.delete_mapping(name.clone()).await? {
        return Err(ServiceError::NotFound(format!("field mapping {}", name)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct PromptListQuery {
    #[serde(default)]
    name: Option<String>,
}

async fn list_prompts(
    State(state): State<AppState>,
    Query(query): Query<PromptListQuery>,
) -> ServiceResult<Json<serde_json::Value>> {
    let prompts = state.knowledge.list_prompts(query.name).await?;
    Ok(Json(serde_json::json!({ "prompts": prompts })))
}

#[derive(Debug, Deserialize)]
struct CreatePromptRequest {
    name: String,
    version: String,
    content: String,
    #[serde(default)]
    description: Option<String>,
}

async fn create_prompt(
    State(state): State<AppState>,
    Json(request): Json<CreatePromptRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    if request.name.trim().is_empty() || request.version.trim().is_empty() {
        return Err(ServiceError::Validation("name and version are required".into()));
    }
    let id = state
        .knowledge
        .create_prompt(request.name, request.version, request.content, request.description)
        .await
        .map_err(|e| ServiceError::Validation(e.to_string()))?;
    Ok(Json(serde_json::json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct ActivatePromptRequest {
    name: String,
    version: String,
}

/// `POST /api/prompt/activate` — atomically activate a prompt version.
async fn activate_prompt(
    State(state): State<AppState>,
    Json(request): Json<ActivatePromptRequest>,
) -> ServiceResult<Json<serde_json::Value>> {
    let activated = state
        .knowledge
        .activate_prompt(request.name.clone(), request.version.clone())
        .await?;
    if !activated {
        return Err(ServiceError::NotFound(format!(
            "prompt {} version {}",
            request.name, request.version
        )));
    }
    Ok(Json(serde_json::json!({ "activated": true })))
}

async fn delete_prompt(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> ServiceResult<Json<serde_json::Value>> {
    let deleted = state
        .knowledge
        .delete_prompt(name.clone(), version.clone())
        .await
        .map_err(|e| ServiceError::Validation(e.to_string()))?;
    if !deleted {
        return Err(ServiceError::NotFound(format!("prompt {} {}", name, version)));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}
