//! Candidate table selection.
//!
//! Tables are scored by keyword overlap between the question's semantic
//! tokens and each table's columns and registered aliases, plus a boost
//! from the user's focus dimensions. When every score stays below the
//! floor, an LLM call over the schema picks the tables instead.

use serde::{Deserialize, Serialize};

use crate::executor::TableSchema;
use crate::knowledge::{KnowledgeSnapshot, UserProfile};
use crate::llm::{LlmDriver, LlmRequest, Message};

use super::tokenize::{SemanticToken, TokenKind};

/// Minimum keyword score required to skip the LLM fallback.
const SCORE_FLOOR: f32 = 1.0;

/// Maximum candidates returned.
const MAX_CANDIDATES: usize = 5;

/// Built-in map from question keywords to table-name fragments. Mirrors
/// the vocabulary of the analytics domain; knowledge-store aliases extend
/// it at runtime.
const KEYWORD_TABLE_HINTS: &[(&str, &[&str])] = &[
    ("销售", &["sales", "orders", "transactions"]),
    ("销量", &["sales", "orders"]),
    ("订单", &["orders", "sales"]),
    ("收入", &["sales", "revenue", "orders"]),
    ("营收", &["sales", "revenue"]),
    ("访问", &["gio_event", "events", "page_view", "visits"]),
    ("访问量", &["gio_event", "events", "visits"]),
    ("浏览", &["gio_event", "events", "page_view"]),
    ("点击", &["gio_event", "events", "clicks"]),
    ("事件", &["gio_event", "events"]),
    ("页面", &["gio_event", "pages"]),
    ("pv", &["gio_event", "page_view"]),
    ("uv", &["gio_event", "visitors"]),
    ("dau", &["gio_event", "users", "active_users"]),
    ("mau", &["gio_event", "users", "active_users"]),
    ("渠道", &["gio_event", "channels", "sources"]),
    ("来源", &["gio_event", "sources"]),
    ("省份", &["gio_event", "regions"]),
    ("经销商", &["dealer_store_info", "dealers"]),
    ("门店", &["dealer_store_info", "stores", "shops"]),
    ("产品", &["products", "items", "goods"]),
    ("商品", &["products", "items", "goods"]),
    ("客户", &["customers", "users", "clients"]),
    ("用户", &["users", "customers", "gio_event"]),
    ("会员", &["members", "customers"]),
    ("库存", &["inventory", "stock"]),
    ("员工", &["employees", "staff"]),
    ("日期", &["gio_event", "sales"]),
    ("统计", &["gio_event", "sales"]),
    ("趋势", &["gio_event", "sales"]),
];

/// A ranked table candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCandidate {
    /// Table name.
    pub name: String,
    /// Leading columns for display.
    pub columns: Vec<String>,
    /// Approximate row count.
    pub row_count: u64,
    /// Why the table was selected.
    pub reason: String,
    /// Keyword score (0 for LLM-selected candidates).
    #[serde(skip)]
    pub score: f32,
}

/// Feasibility estimate: whether the store can plausibly answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feasibility {
    /// Whether an answer looks achievable.
    pub can_answer: bool,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Summary of the contributing signals.
    pub reason: String,
}

/// Score tables against the question's tokens and the user's profile.
pub fn score_tables(
    question: &str,
    tokens: &[SemanticToken],
    schemas: &[TableSchema],
    snapshot: &KnowledgeSnapshot,
    profile: &UserProfile,
) -> Vec<TableCandidate> {
    let question_lower = question.to_lowercase();
    let mut candidates: Vec<TableCandidate> = Vec::new();

    for schema in schemas {
        let mut score = 0.0f32;
        let mut reasons: Vec<String> = Vec::new();
        let table_lower = schema.name.to_lowercase();

        // Direct table name mention.
        if question_lower.contains(&table_lower) {
            score += 3.0;
            reasons.push("mentioned directly".to_string());
        }

        // Built-in keyword hints.
        for (keyword, fragments) in KEYWORD_TABLE_HINTS {
            let hit = if keyword.is_ascii() {
                question_lower.contains(keyword)
            } else {
                question.contains(keyword)
            };
            if hit && fragments.iter().any(|f| table_lower.contains(f)) {
                score += 2.0;
                reasons.push(format!("matches keyword '{}'", keyword));
                break;
            }
        }

        // Semantic tokens against column names and registered aliases.
        for token in tokens {
            let relevant = matches!(
                token.kind,
                TokenKind::Metric | TokenKind::Dimension | TokenKind::Term | TokenKind::FieldMapping
            );
            if !relevant {
                continue;
            }
            if let Some(mapping) = snapshot.mapping(&token.text) {
                if mapping.table_name == schema.name {
                    score += 2.0;
                    reasons.push(format!("alias '{}' targets this table", token.text));
                    continue;
                }
            }
            let text_lower = token.text.to_lowercase();
            if schema
                .columns
                .iter()
                .any(|c| c.to_lowercase().contains(&text_lower))
            {
                score += 1.0;
                reasons.push(format!("has column for '{}'", token.text));
            }
        }

        // Column names quoted verbatim in the question.
        for column in &schema.columns {
            let column_lower = column.to_lowercase();
            if column_lower.len() >= 3 && question_lower.contains(&column_lower) {
                score += 1.0;
                reasons.push(format!("column '{}' mentioned", column));
                break;
            }
        }

        // Learned boost from the user's focus dimensions.
        for dimension in &profile.focus_dimensions {
            let hit = snapshot
                .mapping(dimension)
                .map(|m| m.table_name == schema.name)
                .unwrap_or(false)
                || schema
                    .columns
                    .iter()
                    .any(|c| c.to_lowercase().contains(&dimension.to_lowercase()));
            if hit {
                score += 0.5;
                reasons.push(format!("focus dimension '{}'", dimension));
                break;
            }
        }

        if score > 0.0 {
            reasons.dedup();
            reasons.truncate(3);
            candidates.push(TableCandidate {
                name: schema.name.clone(),
                columns: schema.columns.iter().take(5).cloned().collect(),
                row_count: schema.row_count,
                reason: reasons.join("; "),
                score,
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    candidates.truncate(MAX_CANDIDATES);
    candidates
}

/// Whether the keyword scores justify skipping the LLM fallback.
pub fn above_floor(candidates: &[TableCandidate]) -> bool {
    candidates.iter().any(|c| c.score >= SCORE_FLOOR)
}

/// LLM fallback: ask the model to pick tables from the schema summary.
/// Returns an empty list on any provider or parse failure.
pub async fn llm_select_tables(
    driver: &dyn LlmDriver,
    template: &str,
    question: &str,
    schemas: &[TableSchema],
) -> Vec<TableCandidate> {
    if schemas.is_empty() {
        return Vec::new();
    }

    let schema_description = schemas
        .iter()
        .map(TableSchema::describe)
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = template
        .replace("{schema_description}", &schema_description)
        .replace("{question}", question);

    let request = LlmRequest::new(vec![Message::user(prompt)]).with_temperature(0.1);
    let response = match driver.complete(request).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "LLM table selection failed");
            return Vec::new();
        }
    };

    parse_table_selection(&response, schemas)
}

/// Parse the `{"tables": [...], "reason": "..."}` JSON out of an LLM
/// response that may carry surrounding prose.
fn parse_table_selection(response: &str, schemas: &[TableSchema]) -> Vec<TableCandidate> {
    let start = match response.find('{') {
        Some(pos) => pos,
        None => return Vec::new(),
    };
    let end = match response.rfind('}') {
        Some(pos) => pos + 1,
        None => return Vec::new(),
    };

    let parsed: serde_json::Value = match serde_json::from_str(&response[start..end]) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    let reason = parsed["reason"].as_str().unwrap_or("model selection");
    let names: Vec<String> = parsed["tables"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    names
        .into_iter()
        .filter_map(|name| {
            schemas.iter().find(|s| s.name == name).map(|schema| TableCandidate {
                name: schema.name.clone(),
                columns: schema.columns.iter().take(5).cloned().collect(),
                row_count: schema.row_count,
                reason: format!("model selection: {}", reason),
                score: 0.0,
            })
        })
        .take(MAX_CANDIDATES)
        .collect()
}

/// Estimate whether the question can be answered from the selected tables
/// and knowledge. Confidence accumulates from table matches, knowledge
/// hits, and keyword-to-table coverage.
pub fn check_feasibility(
    tokens: &[SemanticToken],
    candidates: &[TableCandidate],
    knowledge_count: usize,
) -> Feasibility {
    let mut confidence = 0.0f32;
    let mut reasons: Vec<String> = Vec::new();

    if candidates.is_empty() {
        reasons.push("no matching tables".to_string());
    } else {
        confidence += 0.5;
        reasons.push(format!("{} candidate tables", candidates.len()));
    }

    if knowledge_count > 0 {
        confidence += 0.2;
        reasons.push(format!("{} knowledge items", knowledge_count));
    }

    let business_tokens: Vec<&SemanticToken> = tokens
        .iter()
        .filter(|t| matches!(t.kind, TokenKind::Metric | TokenKind::Term | TokenKind::FieldMapping))
        .collect();
    if !business_tokens.is_empty() {
        let covered = business_tokens
            .iter()
            .filter(|t| {
                candidates
                    .iter()
                    .any(|c| c.reason.contains(t.text.as_str()))
            })
            .count();
        confidence += 0.3 * covered as f32 / business_tokens.len() as f32;
        if covered < business_tokens.len() {
            let missing: Vec<&str> = business_tokens
                .iter()
                .filter(|t| !candidates.iter().any(|c| c.reason.contains(t.text.as_str())))
                .map(|t| t.text.as_str())
                .collect();
            reasons.push(format!("uncovered keywords: {}", missing.join(", ")));
        }
    }

    Feasibility {
        can_answer: confidence >= 0.3 && !candidates.is_empty(),
        confidence: (confidence * 100.0).round() / 100.0,
        reason: reasons.join("; "),
    }
}
