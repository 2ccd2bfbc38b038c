//! RAG Q/A corpus.
//!
//! High-quality question/SQL pairs mined from feedback, stored with their
//! embeddings and scores. Retrieval is cosine top-K over the embeddings
//! with a keyword fallback when no query vector is available.

pub mod learner;

pub use learner::{LearnOutcome, Ratings, RagLearner};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embedding::{
    cosine_similarity, deserialize_embedding, keyword_overlap, serialize_embedding,
};

/// Gates applied to exemplars served from the corpus.
pub const RETRIEVAL_MIN_SCORE: f64 = 3.5;
/// Quality floor for served exemplars.
pub const RETRIEVAL_MIN_QUALITY: f64 = 0.7;
/// Minimum similarity for a retrieval hit.
const RETRIEVAL_MIN_SIMILARITY: f32 = 0.3;

/// Eviction thresholds: entries below this composite score with zero
/// usage are removed once old enough.
const EVICT_MAX_SCORE: f64 = 3.0;
/// Minimum age in days before an entry can be evicted.
const EVICT_MIN_AGE_DAYS: i64 = 30;

/// A stored question/SQL pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPair {
    /// Unique identifier.
    pub id: String,
    /// The question.
    pub question: String,
    /// The SQL that answered it.
    pub sql: String,
    /// Short answer preview.
    pub answer_preview: String,
    /// Highest single rating that contributed.
    pub raw_score: f64,
    /// Weighted composite score.
    pub score: f64,
    /// Structural quality score in [0, 1].
    pub quality_score: f64,
    /// Origin: "expert", "feedback", or "auto".
    pub source: String,
    /// Conversation the pair came from.
    pub conversation_id: Option<String>,
    /// Topic tags.
    pub tags: Vec<String>,
    /// Question category.
    pub category: String,
    /// How many times the pair served as an exemplar.
    pub usage_count: i64,
}

/// A retrieval hit with its similarity to the query.
#[derive(Debug, Clone)]
pub struct RagHit {
    /// The stored pair.
    pub pair: QaPair,
    /// Similarity to the query in [0, 1].
    pub similarity: f32,
}

/// Corpus statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusStats {
    /// Total stored pairs.
    pub total: i64,
    /// Mean composite score.
    pub avg_score: f64,
    /// Mean quality score.
    pub avg_quality: f64,
    /// Pairs that carry an embedding.
    pub with_embedding: i64,
}

/// SQLite-backed Q/A corpus.
pub struct RagCorpus {
    db_path: PathBuf,
    sqlite: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for RagCorpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RagCorpus")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl RagCorpus {
    /// Create a corpus over the given database file.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            sqlite: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the database and apply the schema.
    pub async fn init(&self) -> Result<()> {
        let sqlite = self.sqlite.clone();
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = sqlite.lock().unwrap();
            if guard.is_none() {
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(&db_path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS rag_qa_pairs (
                        id TEXT PRIMARY KEY,
                        question TEXT NOT NULL,
                        sql TEXT NOT NULL,
                        answer_preview TEXT NOT NULL DEFAULT '',
                        embedding BLOB,
                        raw_score REAL NOT NULL DEFAULT 0,
                        score REAL NOT NULL DEFAULT 0,
                        quality_score REAL NOT NULL DEFAULT 0,
                        source TEXT NOT NULL DEFAULT 'auto',
                        conversation_id TEXT,
                        tags TEXT,
                        category TEXT NOT NULL DEFAULT 'general',
                        usage_count INTEGER NOT NULL DEFAULT 0,
                        last_used_at TEXT,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_rag_score
                        ON rag_qa_pairs(score DESC, quality_score DESC);
                    CREATE INDEX IF NOT EXISTS idx_rag_source ON rag_qa_pairs(source);",
                )?;
                *guard = Some(conn);
            }
            Ok(())
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sqlite = self.sqlite.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let guard = sqlite.lock().unwrap();
            let conn = guard
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("rag corpus not initialized"))?;
            f(conn)
        })
        .await
        .context("spawn_blocking failed")?
    }

    /// Insert a new pair with its embedding. Returns the new ID.
    pub async fn add(&self, pair: QaPair, embedding: Option<Vec<f32>>) -> Result<String> {
        let id = if pair.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            pair.id.clone()
        };
        let stored_id = id.clone();

        self.call(move |conn| {
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO rag_qa_pairs
                 (id, question, sql, answer_preview, embedding, raw_score, score,
                  quality_score, source, conversation_id, tags, category,
                  usage_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)",
                params![
                    stored_id,
                    pair.question,
                    pair.sql,
                    pair.answer_preview,
                    embedding.as_deref().map(serialize_embedding),
                    pair.raw_score,
                    pair.score,
                    pair.quality_score,
                    pair.source,
                    pair.conversation_id,
                    serde_json::to_string(&pair.tags)?,
                    pair.category,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;

        tracing::info!(id = %id, "rag pair stored");
        Ok(id)
    }

    /// Merge a duplicate hit into an existing entry: bump usage, keep the
    /// max of each score.
    pub async fn merge(&self, id: String, score: f64, quality_score: f64) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE rag_qa_pairs
                 SET usage_count = usage_count + 1,
                     score = MAX(score, ?2),
                     quality_score = MAX(quality_score, ?3),
                     updated_at = ?4
                 WHERE id = ?1",
                params![id, score, quality_score, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a pair being served as an exemplar.
    pub async fn record_usage(&self, id: String) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE rag_qa_pairs
                 SET usage_count = usage_count + 1, last_used_at = ?2
                 WHERE id = ?1",
                params![id, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Nearest entry to the embedding, with its similarity.
    pub async fn find_nearest(&self, embedding: Vec<f32>) -> Result<Option<(QaPair, f32)>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, question, sql, answer_preview, raw_score, score,
                        quality_score, source, conversation_id, tags, category,
                        usage_count, embedding
                 FROM rag_qa_pairs WHERE embedding IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                let blob: Vec<u8> = row.get(12)?;
                Ok((row_to_pair(row)?, blob))
            })?;

            let mut best: Option<(QaPair, f32)> = None;
            for row in rows {
                let (pair, blob) = row?;
                let Some(stored) = deserialize_embedding(&blob) else {
                    continue;
                };
                let similarity = cosine_similarity(&embedding, &stored);
                if best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true) {
                    best = Some((pair, similarity));
                }
            }
            Ok(best)
        })
        .await
    }

    /// Retrieve exemplars similar to the question. Entries must pass the
    /// composite and quality gates; similarity comes from the embedding
    /// when a query vector is given, keyword overlap otherwise.
    pub async fn retrieve(
        &self,
        question: String,
        query_embedding: Option<Vec<f32>>,
        top_k: usize,
    ) -> Result<Vec<RagHit>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, question, sql, answer_preview, raw_score, score,
                        quality_score, source, conversation_id, tags, category,
                        usage_count, embedding
                 FROM rag_qa_pairs
                 WHERE score >= ?1 AND quality_score >= ?2",
            )?;
            let rows = stmt.query_map(params![RETRIEVAL_MIN_SCORE, RETRIEVAL_MIN_QUALITY], |row| {
                let blob: Option<Vec<u8>> = row.get(12)?;
                Ok((row_to_pair(row)?, blob))
            })?;

            let mut hits: Vec<(RagHit, f32)> = Vec::new();
            for row in rows {
                let (pair, blob) = row?;
                let similarity = match (&query_embedding, blob) {
                    (Some(query), Some(blob)) => match deserialize_embedding(&blob) {
                        Some(stored) => cosine_similarity(query, &stored),
                        None => keyword_overlap(&question, &pair.question),
                    },
                    _ => keyword_overlap(&question, &pair.question),
                };
                if similarity < RETRIEVAL_MIN_SIMILARITY {
                    continue;
                }
                let rank = similarity * 0.6 + pair.quality_score as f32 * 0.4;
                hits.push((RagHit { pair, similarity }, rank));
            }

            hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            Ok(hits.into_iter().take(top_k).map(|(hit, _)| hit).collect())
        })
        .await
    }

    /// High-scoring entries for the admin surface.
    pub async fn high_score(&self, limit: usize, min_score: f64) -> Result<Vec<QaPair>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, question, sql, answer_preview, raw_score, score,
                        quality_score, source, conversation_id, tags, category,
                        usage_count
                 FROM rag_qa_pairs WHERE score >= ?1
                 ORDER BY score DESC, updated_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![min_score, limit as i64], row_to_pair)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Corpus statistics.
    pub async fn stats(&self) -> Result<CorpusStats> {
        self.call(|conn| {
            let (total, avg_score, avg_quality, with_embedding) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(AVG(score), 0),
                        COALESCE(AVG(quality_score), 0),
                        COALESCE(SUM(embedding IS NOT NULL), 0)
                 FROM rag_qa_pairs",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?;
            Ok(CorpusStats {
                total,
                avg_score: (avg_score * 100.0).round() / 100.0,
                avg_quality: (avg_quality * 100.0).round() / 100.0,
                with_embedding,
            })
        })
        .await
    }

    /// Remove low-value entries: composite below the floor, never used,
    /// and older than the retention window. Returns the number removed.
    pub async fn evict_stale(&self) -> Result<usize> {
        self.call(|conn| {
            let cutoff = (chrono::Utc::now() - chrono::Duration::days(EVICT_MIN_AGE_DAYS))
                .to_rfc3339();
            let removed = conn.execute(
                "DELETE FROM rag_qa_pairs
                 WHERE score < ?1 AND usage_count = 0 AND created_at < ?2",
                params![EVICT_MAX_SCORE, cutoff],
            )?;
            Ok(removed)
        })
        .await
    }

    /// Fetch a pair by ID.
    pub async fn get(&self, id: String) -> Result<Option<QaPair>> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, question, sql, answer_preview, raw_score, score,
                            quality_score, source, conversation_id, tags, category,
                            usage_count
                     FROM rag_qa_pairs WHERE id = ?1",
                    params![id],
                    row_to_pair,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }
}

fn row_to_pair(row: &rusqlite::Row<'_>) -> rusqlite::Result<QaPair> {
    let tags: Option<String> = row.get(9)?;
    Ok(QaPair {
        id: row.get(0)?,
        question: row.get(1)?,
        sql: row.get(2)?,
        answer_preview: row.get(3)?,
        raw_score: row.get(4)?,
        score: row.get(5)?,
        quality_score: row.get(6)?,
        source: row.get(7)?,
        conversation_id: row.get(8)?,
        tags: tags
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
        category: row.get(10)?,
        usage_count: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(question: &str, score: f64, quality: f64) -> QaPair {
        QaPair {
            id: String::new(),
            question: question.to_string(),
            sql: "SELECT event_date, COUNT(*) FROM gio_event GROUP BY event_date".to_string(),
            answer_preview: "daily visits".to_string(),
            raw_score: score,
            score,
            quality_score: quality,
            source: "expert".to_string(),
            conversation_id: None,
            tags: vec!["trend".to_string()],
            category: "traffic".to_string(),
            usage_count: 0,
        }
    }

    async fn corpus() -> (tempfile::TempDir, RagCorpus) {
        let dir = tempfile::tempdir().unwrap();
        let corpus = RagCorpus::new(dir.path().join("corpus.sqlite"));
        corpus.init().await.unwrap();
        (dir, corpus)
    }

    #[tokio::test]
    async fn test_retrieval_enforces_gates() {
        let (_dir, corpus) = corpus().await;
        corpus
            .add(pair("最近7天的访问量趋势", 5.0, 0.9), None)
            .await
            .unwrap();
        corpus
            .add(pair("最近7天的访问量走势", 3.0, 0.9), None)
            .await
            .unwrap();
        corpus
            .add(pair("最近7天的访问量变化", 5.0, 0.5), None)
            .await
            .unwrap();

        let hits = corpus
            .retrieve("最近7天的访问量趋势".to_string(), None, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].pair.score >= RETRIEVAL_MIN_SCORE);
        assert!(hits[0].pair.quality_score >= RETRIEVAL_MIN_QUALITY);
    }

    #[tokio::test]
    async fn test_vector_retrieval_ranks_by_similarity() {
        let (_dir, corpus) = corpus().await;
        corpus
            .add(pair("访问量趋势", 5.0, 0.9), Some(vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        corpus
            .add(pair("销售额排名", 5.0, 0.9), Some(vec![0.0, 1.0, 0.0]))
            .await
            .unwrap();

        let hits = corpus
            .retrieve("any".to_string(), Some(vec![0.7, 0.6, 0.0]), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].pair.question, "访问量趋势");
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[tokio::test]
    async fn test_merge_keeps_max_scores_and_bumps_usage() {
        let (_dir, corpus) = corpus().await;
        let id = corpus.add(pair("q", 4.2, 0.8), None).await.unwrap();
        corpus.merge(id.clone(), 4.0, 0.9).await.unwrap();

        let stored = corpus.get(id).await.unwrap().unwrap();
        assert_eq!(stored.score, 4.2);
        assert_eq!(stored.quality_score, 0.9);
        assert_eq!(stored.usage_count, 1);
    }

    #[tokio::test]
    async fn test_eviction_spares_recent_and_used_entries() {
        let (_dir, corpus) = corpus().await;
        corpus.add(pair("recent low", 2.0, 0.8), None).await.unwrap();
        let removed = corpus.evict_stale().await.unwrap();
        // The entry is low-scoring and unused but not old enough.
        assert_eq!(removed, 0);
        assert_eq!(corpus.stats().await.unwrap().total, 1);
    }
}
