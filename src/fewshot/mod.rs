//! Few-shot exemplar selection.
//!
//! Merges two retrieval sources into ranked exemplars for the prompt:
//! the curated RAG corpus and the user's own successful executions. The
//! corpus carries more weight; duplicates collapse by question
//! fingerprint.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::memory::AgentMemory;
use crate::rag::RagCorpus;

/// Default number of exemplars injected into the prompt.
pub const DEFAULT_LIMIT: usize = 3;

/// Weight applied to corpus similarity.
const RAG_WEIGHT: f32 = 0.6;
/// Weight applied to execution-memory similarity.
const MEMORY_WEIGHT: f32 = 0.4;

/// Where an exemplar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemplarSource {
    /// The curated Q/A corpus.
    Rag,
    /// The user's execution memory.
    Memory,
}

/// An approved question/SQL pair injected into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exemplar {
    /// The example question.
    pub question: String,
    /// The SQL that answered it.
    pub sql: String,
    /// Which source produced it.
    pub source: ExemplarSource,
    /// Weighted similarity to the current question.
    pub similarity: f32,
}

/// Debug block persisted onto the assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FewShotDebug {
    /// Whether the corpus contributed candidates.
    pub rag_used: bool,
    /// Corpus candidates before merging.
    pub rag_count: usize,
    /// Whether execution memory contributed candidates.
    pub memory_used: bool,
    /// Memory candidates before merging.
    pub memory_count: usize,
}

/// Selection result.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Ranked exemplars, at most the requested limit.
    pub exemplars: Vec<Exemplar>,
    /// Debug block, present when requested.
    pub debug: Option<FewShotDebug>,
}

/// The few-shot selector.
pub struct FewShotSelector {
    corpus: Arc<RagCorpus>,
    memory: Arc<AgentMemory>,
    embedder: Arc<dyn Embedder>,
}

impl FewShotSelector {
    /// Create a selector.
    pub fn new(
        corpus: Arc<RagCorpus>,
        memory: Arc<AgentMemory>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            corpus,
            memory,
            embedder,
        }
    }

    /// Select exemplars for a question. Retrieval failures degrade to an
    /// empty source rather than failing the request.
    pub async fn select(
        &self,
        question: &str,
        user_id: &str,
        limit: usize,
        return_debug: bool,
    ) -> Selection {
        let query_embedding = match self.embedder.embed(question).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::debug!(error = %e, "few-shot embedding unavailable");
                None
            }
        };

        let rag_hits = match self
            .corpus
            .retrieve(question.to_string(), query_embedding, limit * 2)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "rag retrieval failed");
                Vec::new()
            }
        };

        let memory_hits = match self
            .memory
            .search_similar_sql(user_id.to_string(), question.to_string(), limit * 2)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "memory retrieval failed");
                Vec::new()
            }
        };

        let debug = return_debug.then(|| FewShotDebug {
            rag_used: !rag_hits.is_empty(),
            rag_count: rag_hits.len(),
            memory_used: !memory_hits.is_empty(),
            memory_count: memory_hits.len(),
        });

        // Merge on the shared similarity scale.
        let mut merged: Vec<(Exemplar, Option<String>)> = Vec::new();
        for hit in rag_hits {
            merged.push((
                Exemplar {
                    question: hit.pair.question.clone(),
                    sql: hit.pair.sql.clone(),
                    source: ExemplarSource::Rag,
                    similarity: hit.similarity * RAG_WEIGHT,
                },
                Some(hit.pair.id),
            ));
        }
        for hit in memory_hits {
            merged.push((
                Exemplar {
                    question: hit.question,
                    sql: hit.sql,
                    source: ExemplarSource::Memory,
                    similarity: hit.similarity * MEMORY_WEIGHT,
                },
                None,
            ));
        }

        merged.sort_by(|a, b| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut seen = std::collections::HashSet::new();
        let mut exemplars = Vec::new();
        let mut served_ids = Vec::new();
        for (exemplar, id) in merged {
            if !seen.insert(fingerprint(&exemplar.question)) {
                continue;
            }
            if let Some(id) = id {
                served_ids.push(id);
            }
            exemplars.push(exemplar);
            if exemplars.len() >= limit {
                break;
            }
        }

        // Usage statistics for the corpus entries that actually served.
        for id in served_ids {
            if let Err(e) = self.corpus.record_usage(id).await {
                tracing::debug!(error = %e, "usage update failed");
            }
        }

        Selection { exemplars, debug }
    }
}

/// Question fingerprint for deduplication: lowercased with whitespace
/// collapsed.
fn fingerprint(question: &str) -> String {
    question.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Format exemplars for prompt injection.
pub fn format_exemplars(exemplars: &[Exemplar]) -> String {
    if exemplars.is_empty() {
        return "(no examples available)".to_string();
    }
    exemplars
        .iter()
        .map(|e| format!("Q: {}\nA (SQL): {}", e.question, e.sql))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::QaPair;
    use async_trait::async_trait;

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("embedder offline")
        }

        fn dimensions(&self) -> usize {
            0
        }
    }

    async fn selector() -> (tempfile::TempDir, Arc<RagCorpus>, Arc<AgentMemory>, FewShotSelector) {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Arc::new(RagCorpus::new(dir.path().join("store.sqlite")));
        corpus.init().await.unwrap();
        let memory = Arc::new(AgentMemory::new(dir.path().join("store.sqlite")));
        memory.init().await.unwrap();
        let selector = FewShotSelector::new(corpus.clone(), memory.clone(), Arc::new(FailingEmbedder));
        (dir, corpus, memory, selector)
    }

    fn qa(question: &str) -> QaPair {
        QaPair {
            id: String::new(),
            question: question.to_string(),
            sql: "SELECT event_date, COUNT(*) FROM gio_event GROUP BY event_date".to_string(),
            answer_preview: String::new(),
            raw_score: 5.0,
            score: 5.0,
            quality_score: 0.9,
            source: "expert".to_string(),
            conversation_id: None,
            tags: Vec::new(),
            category: "traffic".to_string(),
            usage_count: 0,
        }
    }

    #[tokio::test]
    async fn test_merges_both_sources_with_rag_preferred() {
        let (_dir, corpus, memory, selector) = selector().await;
        corpus.add(qa("最近7天的访问量趋势"), None).await.unwrap();
        memory
            .save_tool_usage(
                "最近7天的访问量趋势".into(),
                "run_sql".into(),
                serde_json::json!({"sql": "SELECT * FROM gio_event"}),
                true,
                "u1".into(),
            )
            .await
            .unwrap();

        let selection = selector
            .select("最近7天的访问量趋势", "u1", DEFAULT_LIMIT, true)
            .await;

        // Identical questions deduplicate; the corpus entry wins because
        // its weighted similarity (1.0 * 0.6) beats memory (1.0 * 0.4).
        assert_eq!(selection.exemplars.len(), 1);
        assert_eq!(selection.exemplars[0].source, ExemplarSource::Rag);

        let debug = selection.debug.unwrap();
        assert!(debug.rag_used);
        assert_eq!(debug.rag_count, 1);
        assert!(debug.memory_used);
        assert_eq!(debug.memory_count, 1);
    }

    #[tokio::test]
    async fn test_limit_caps_exemplars() {
        let (_dir, corpus, _memory, selector) = selector().await;
        for i in 0..6 {
            corpus
                .add(qa(&format!("最近7天的访问量趋势 第{}问", i)), None)
                .await
                .unwrap();
        }

        let selection = selector.select("最近7天的访问量趋势", "u1", 3, false).await;
        assert!(selection.exemplars.len() <= 3);
        assert!(selection.debug.is_none());
    }

    #[tokio::test]
    async fn test_empty_sources_degrade_gracefully() {
        let (_dir, _corpus, _memory, selector) = selector().await;
        let selection = selector.select("任意问题", "u1", 3, true).await;
        assert!(selection.exemplars.is_empty());
        let debug = selection.debug.unwrap();
        assert!(!debug.rag_used);
        assert!(!debug.memory_used);
    }

    #[test]
    fn test_format_exemplars_shape() {
        let exemplars = vec![Exemplar {
            question: "销量Top10".into(),
            sql: "SELECT * FROM sales".into(),
            source: ExemplarSource::Rag,
            similarity: 0.9,
        }];
        let formatted = format_exemplars(&exemplars);
        assert!(formatted.starts_with("Q: 销量Top10"));
        assert!(formatted.contains("A (SQL): SELECT * FROM sales"));
    }
}
