//! Multi-stage query analysis.
//!
//! Transforms a raw question into a structured plan: typed semantic
//! tokens, a rewritten question, ranked candidate tables, and the
//! knowledge items that matched. Analysis never fails a request; each
//! stage degrades independently and leaves a note in the warnings list.

pub mod rewrite;
pub mod tables;
pub mod tokenize;

pub use tables::{Feasibility, TableCandidate};
pub use tokenize::{SemanticToken, TokenKind, TokenKnowledge};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::ChartType;
use crate::executor::{QueryExecutor, TableSchema};
use crate::knowledge::{KnowledgeItem, KnowledgeStore, UserProfile};
use crate::llm::LlmDriver;

use rewrite::Rewriter;
use tokenize::Tokenizer;

/// Per-request context for analysis.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    /// User asking the question.
    pub user_id: String,
    /// The previous assistant turn, for pronoun resolution.
    pub last_turn: Option<String>,
    /// The user's profile.
    pub profile: UserProfile,
}

/// Output of the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// The question as submitted.
    pub original_question: String,
    /// The normalized question.
    pub rewritten_question: String,
    /// Typed spans over the original question.
    pub semantic_tokens: Vec<SemanticToken>,
    /// Ranked candidate tables with reasons.
    pub candidate_tables: Vec<TableCandidate>,
    /// Knowledge items matched by the tokens, in question order.
    pub relevant_knowledge: Vec<KnowledgeItem>,
    /// Whether the question looks answerable.
    pub feasibility: Feasibility,
    /// Chart preference detected in the question.
    pub chart_hint: Option<ChartType>,
    /// Degradation notes for the debug block.
    pub warnings: Vec<String>,
}

impl Analysis {
    /// Stable fingerprint over the analysis inputs that shape the prompt,
    /// used as part of the composer's cache key.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.rewritten_question.as_bytes());
        for table in &self.candidate_tables {
            hasher.update(table.name.as_bytes());
        }
        for item in &self.relevant_knowledge {
            hasher.update(item.keyword.as_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

/// The query analyzer.
pub struct QueryAnalyzer {
    knowledge: Arc<KnowledgeStore>,
    driver: Arc<dyn LlmDriver>,
    rewriter: Rewriter,
    schemas: RwLock<Vec<TableSchema>>,
}

impl std::fmt::Debug for QueryAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryAnalyzer")
            .field("tables", &self.schemas.read().len())
            .finish()
    }
}

impl QueryAnalyzer {
    /// Create an analyzer. Call [`Self::refresh_schema`] before first use.
    pub fn new(knowledge: Arc<KnowledgeStore>, driver: Arc<dyn LlmDriver>) -> Self {
        Self {
            rewriter: Rewriter::new(driver.clone(), knowledge.clone()),
            knowledge,
            driver,
            schemas: RwLock::new(Vec::new()),
        }
    }

    /// Reload the table schemas from the executor.
    pub async fn refresh_schema(&self, executor: &dyn QueryExecutor) -> anyhow::Result<()> {
        let schemas = executor.schema().await?;
        tracing::info!(tables = schemas.len(), "analyzer schema refreshed");
        *self.schemas.write() = schemas;
        Ok(())
    }

    /// Current table schemas.
    pub fn schemas(&self) -> Vec<TableSchema> {
        self.schemas.read().clone()
    }

    /// Analyze a question. Never fails; stages degrade independently.
    pub async fn analyze(&self, question: &str, ctx: &AnalysisContext) -> Analysis {
        let snapshot = self.knowledge.snapshot();
        let mut warnings = Vec::new();

        // 1. Semantic tokenization over the dictionaries.
        let tokenizer = Tokenizer::new(&snapshot);
        let semantic_tokens = tokenizer.tokenize(question);

        // 2. Knowledge items from matched tokens, deduplicated by keyword
        //    and ordered by token position.
        let relevant_knowledge = collect_knowledge(&semantic_tokens);

        // 3. Question rewriting through the LLM, cached.
        let (rewritten_question, degraded) = self
            .rewriter
            .rewrite(question, &ctx.user_id, ctx.last_turn.as_deref(), &snapshot)
            .await;
        if degraded {
            warnings.push("rewrite degraded to raw question".to_string());
        }

        // 4. Table selection, with LLM fallback below the score floor.
        let schemas = self.schemas();
        let mut candidate_tables = tables::score_tables(
            question,
            &semantic_tokens,
            &schemas,
            &snapshot,
            &ctx.profile,
        );
        if !tables::above_floor(&candidate_tables) && !schemas.is_empty() {
            let template = self
                .knowledge
                .active_prompt_content(
                    "table_select_prompt",
                    crate::knowledge::store::DEFAULT_TABLE_SELECT_PROMPT,
                )
                .await;
            let llm_candidates = tables::llm_select_tables(
                self.driver.as_ref(),
                &template,
                question,
                &schemas,
            )
            .await;
            if llm_candidates.is_empty() {
                warnings.push("table selection found no confident match".to_string());
            } else {
                candidate_tables = llm_candidates;
            }
        }

        // 5. Feasibility estimate for the debug block.
        let feasibility = tables::check_feasibility(
            &semantic_tokens,
            &candidate_tables,
            relevant_knowledge.len(),
        );

        let chart_hint = semantic_tokens
            .iter()
            .find(|t| t.kind == TokenKind::ChartHint)
            .and_then(|t| t.knowledge.as_ref())
            .and_then(|k| k.value.as_deref())
            .and_then(|v| serde_json::from_value(serde_json::Value::String(v.to_string())).ok());

        Analysis {
            original_question: question.to_string(),
            rewritten_question,
            semantic_tokens,
            candidate_tables,
            relevant_knowledge,
            feasibility,
            chart_hint,
            warnings,
        }
    }
}

/// Collect knowledge items from matched tokens, deduplicated by keyword,
/// ordered by token position.
fn collect_knowledge(tokens: &[SemanticToken]) -> Vec<KnowledgeItem> {
    let mut seen = std::collections::HashSet::new();
    let mut items = Vec::new();
    for token in tokens {
        let Some(knowledge) = &token.knowledge else {
            continue;
        };
        let kind = match token.kind {
            TokenKind::TimeRule => "time_rule",
            TokenKind::Term => "term",
            TokenKind::FieldMapping => "mapping",
            _ => continue,
        };
        if !seen.insert(token.text.clone()) {
            continue;
        }
        items.push(KnowledgeItem {
            kind: kind.to_string(),
            keyword: token.text.clone(),
            description: knowledge.description.clone(),
            value: knowledge.value.clone(),
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tokenize::Tokenizer;
    use crate::knowledge::KnowledgeSnapshot;

    #[test]
    fn test_collect_knowledge_dedupes_and_preserves_order() {
        let snapshot = KnowledgeSnapshot::default();
        let tokenizer = Tokenizer::new(&snapshot);
        let tokens = tokenizer.tokenize("最近7天和最近7天的访问量");
        let items = collect_knowledge(&tokens);

        let time_items: Vec<_> = items.iter().filter(|i| i.kind == "time_rule").collect();
        assert_eq!(time_items.len(), 1, "duplicate keyword must collapse");
        assert_eq!(time_items[0].keyword, "最近7天");
    }
}
