//! Feedback learner.
//!
//! Turns rated conversations into corpus entries. A composite score over
//! the present ratings and a structural quality score gate ingestion;
//! near-duplicates merge into the existing entry instead of multiplying.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::tools::guard_sql;

use super::{QaPair, RagCorpus};

/// Composite score gate for storing a pair.
const MIN_COMPOSITE: f64 = 4.0;
/// Quality score gate for storing a pair.
const MIN_QUALITY: f64 = 0.7;
/// Embedding similarity at which two questions count as duplicates.
const DEDUP_SIMILARITY: f32 = 0.93;
/// Composite improvement below which a duplicate merges instead of
/// creating a new entry.
const DEDUP_SCORE_GAP: f64 = 0.2;

/// Rating weights: expert 0.5, LLM judge 0.3, user vote 0.2.
const EXPERT_WEIGHT: f64 = 0.5;
const LLM_WEIGHT: f64 = 0.3;
const USER_WEIGHT: f64 = 0.2;

/// User vote on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserVote {
    /// Thumbs up; counts as a rating of 5.
    Like,
    /// Thumbs down; counts as a rating of 1.
    Dislike,
    /// No vote; ignored in the composite.
    #[default]
    None,
}

/// Ratings attached to one conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ratings {
    /// Expert rating in 1..=5.
    pub expert: Option<u8>,
    /// User vote.
    pub user_vote: Option<UserVote>,
    /// LLM-judge score in 1..=5.
    pub llm: Option<f64>,
}

impl Ratings {
    /// Weighted composite over the ratings actually present. Absent
    /// ratings do not bias the result; with none present, returns None.
    pub fn composite(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut weight = 0.0;

        if let Some(expert) = self.expert {
            sum += f64::from(expert) * EXPERT_WEIGHT;
            weight += EXPERT_WEIGHT;
        }
        if let Some(llm) = self.llm {
            sum += llm * LLM_WEIGHT;
            weight += LLM_WEIGHT;
        }
        match self.user_vote {
            Some(UserVote::Like) => {
                sum += 5.0 * USER_WEIGHT;
                weight += USER_WEIGHT;
            }
            Some(UserVote::Dislike) => {
                sum += 1.0 * USER_WEIGHT;
                weight += USER_WEIGHT;
            }
            Some(UserVote::None) | None => {}
        }

        if weight == 0.0 {
            return None;
        }
        Some(((sum / weight) * 100.0).round() / 100.0)
    }

    /// Highest single rating present, recorded as the raw score.
    pub fn raw(&self) -> f64 {
        let mut raw = 0.0f64;
        if let Some(expert) = self.expert {
            raw = raw.max(f64::from(expert));
        }
        if let Some(llm) = self.llm {
            raw = raw.max(llm);
        }
        match self.user_vote {
            Some(UserVote::Like) => raw = raw.max(5.0),
            Some(UserVote::Dislike) => raw = raw.max(1.0),
            _ => {}
        }
        raw
    }
}

/// What the learner did with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnOutcome {
    /// A new corpus entry was created.
    Stored(String),
    /// An existing near-duplicate was updated.
    Updated(String),
    /// The submission did not pass the gates.
    Skipped(&'static str),
}

/// The feedback learner.
pub struct RagLearner {
    corpus: Arc<RagCorpus>,
    embedder: Arc<dyn Embedder>,
}

impl RagLearner {
    /// Create a learner over the corpus.
    pub fn new(corpus: Arc<RagCorpus>, embedder: Arc<dyn Embedder>) -> Self {
        Self { corpus, embedder }
    }

    /// Learn from a rated conversation.
    pub async fn learn(
        &self,
        conversation_id: &str,
        question: &str,
        sql: Option<&str>,
        answer: &str,
        ratings: Ratings,
        source: &str,
    ) -> anyhow::Result<LearnOutcome> {
        let Some(composite) = ratings.composite() else {
            return Ok(LearnOutcome::Skipped("no ratings present"));
        };
        if composite < MIN_COMPOSITE {
            return Ok(LearnOutcome::Skipped("composite score below gate"));
        }

        let Some(cleaned_sql) = sql.and_then(clean_sql) else {
            return Ok(LearnOutcome::Skipped("no usable SQL"));
        };

        let quality = quality_score(question, &cleaned_sql, answer);
        if quality < MIN_QUALITY {
            return Ok(LearnOutcome::Skipped("quality score below gate"));
        }

        // Embedding degrades to keyword-only dedup and retrieval.
        let embedding = match self.embedder.embed(question).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, storing without vector");
                None
            }
        };

        // Near-duplicate check: merge unless the new composite is a clear
        // improvement.
        if let Some(ref vector) = embedding {
            if let Some((existing, similarity)) =
                self.corpus.find_nearest(vector.clone()).await?
            {
                if similarity >= DEDUP_SIMILARITY
                    && composite - existing.score < DEDUP_SCORE_GAP
                {
                    tracing::info!(
                        id = %existing.id,
                        similarity,
                        "near-duplicate merged"
                    );
                    self.corpus
                        .merge(existing.id.clone(), composite, quality)
                        .await?;
                    return Ok(LearnOutcome::Updated(existing.id));
                }
            }
        }

        let pair = QaPair {
            id: String::new(),
            question: question.to_string(),
            sql: cleaned_sql.clone(),
            answer_preview: answer_preview(answer, 200),
            raw_score: ratings.raw(),
            score: composite,
            quality_score: quality,
            source: source.to_string(),
            conversation_id: Some(conversation_id.to_string()),
            tags: extract_tags(question, &cleaned_sql),
            category: categorize(question),
            usage_count: 0,
        };
        let id = self.corpus.add(pair, embedding).await?;
        Ok(LearnOutcome::Stored(id))
    }
}

/// Strip code fences and prose, keeping one SELECT statement.
pub fn clean_sql(sql: &str) -> Option<String> {
    let stripped = sql
        .replace("```sql", "\n")
        .replace("```SQL", "\n")
        .replace("```", "\n");
    let upper = stripped.to_uppercase();
    let start = upper.find("SELECT")?;
    let rest = &stripped[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    let cleaned = rest[..end].trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Structural quality of the triple in [0, 1]: question clarity up to
/// 0.3, SQL validity up to 0.4, answer plausibility up to 0.3.
pub fn quality_score(question: &str, sql: &str, answer: &str) -> f64 {
    let mut score = 0.0;

    // Question clarity (<= 0.3)
    let question = question.trim();
    let qchars = question.chars().count();
    if qchars >= 5 {
        score += 0.1;
    }
    if qchars >= 10 {
        score += 0.1;
    }
    if question.contains('?')
        || question.contains('？')
        || ["如何", "什么", "多少", "哪些"]
            .iter()
            .any(|w| question.contains(w))
    {
        score += 0.1;
    }

    // SQL validity (<= 0.4)
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("SELECT") {
        score += 0.15;
    }
    if upper.contains("FROM") {
        score += 0.1;
    }
    if guard_sql(sql).is_ok() {
        score += 0.1;
    }
    let sql_len = sql.len();
    if (20..=500).contains(&sql_len) {
        score += 0.05;
    }

    // Answer plausibility (<= 0.3)
    let answer = answer.trim();
    if answer.chars().count() > 10 {
        score += 0.1;
    }
    if answer.chars().any(|c| c.is_ascii_digit()) {
        score += 0.1;
    }
    if ["表", "结果", "数据", "result", "data", "chart"]
        .iter()
        .any(|w| answer.to_lowercase().contains(w))
    {
        score += 0.1;
    }

    (score * 100.0f64).round() / 100.0
}

/// Short answer preview: SQL blocks removed, whitespace collapsed,
/// truncated.
pub fn answer_preview(answer: &str, max_chars: usize) -> String {
    let mut without_sql = String::new();
    let mut in_fence = false;
    for line in answer.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            without_sql.push_str(line);
            without_sql.push(' ');
        }
    }
    let collapsed = without_sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Topic tags from the question and the SQL shape.
pub fn extract_tags(question: &str, sql: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let question_lower = question.to_lowercase();

    if ["访问", "pv", "uv"].iter().any(|k| question_lower.contains(k)) {
        tags.push("traffic".to_string());
    }
    if ["销售", "订单", "收入"].iter().any(|k| question_lower.contains(k)) {
        tags.push("sales".to_string());
    }
    if ["趋势", "变化", "走势"].iter().any(|k| question_lower.contains(k)) {
        tags.push("trend".to_string());
    }
    if ["分布", "占比", "比例"].iter().any(|k| question_lower.contains(k)) {
        tags.push("distribution".to_string());
    }
    if ["排名", "top", "最高", "最低"].iter().any(|k| question_lower.contains(k)) {
        tags.push("ranking".to_string());
    }

    let upper = sql.to_uppercase();
    if upper.contains("GROUP BY") {
        tags.push("grouped".to_string());
    }
    if upper.contains("JOIN") {
        tags.push("join".to_string());
    }

    tags
}

/// Coarse question category.
pub fn categorize(question: &str) -> String {
    let lower = question.to_lowercase();
    if ["访问", "pv", "uv", "dau", "mau"].iter().any(|k| lower.contains(k)) {
        "traffic".to_string()
    } else if ["销售", "订单", "收入", "营收"].iter().any(|k| lower.contains(k)) {
        "sales".to_string()
    } else if ["用户", "客户", "会员"].iter().any(|k| lower.contains(k)) {
        "users".to_string()
    } else if ["产品", "商品"].iter().any(|k| lower.contains(k)) {
        "products".to_string()
    } else if ["渠道", "来源"].iter().any(|k| lower.contains(k)) {
        "channels".to_string()
    } else if ["区域", "城市", "省份", "地区"].iter().any(|k| lower.contains(k)) {
        "regions".to_string()
    } else {
        "general".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Deterministic embedder: a fixed vector per distinct question.
    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            // Two nearly identical questions embed to nearly identical
            // vectors; anything else is orthogonal-ish by first char.
            let seed = text.chars().next().map(|c| c as u32 % 7).unwrap_or(0);
            let mut v = vec![0.0f32; 8];
            v[seed as usize] = 1.0;
            v[(seed as usize + 1) % 8] = 0.1;
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    const GOOD_SQL: &str = "SELECT event_date, COUNT(*) AS visits FROM gio_event GROUP BY event_date";
    const GOOD_ANSWER: &str = "最近7天访问量合计 1234，最高一天 300，数据见结果表。";

    async fn learner() -> (tempfile::TempDir, Arc<RagCorpus>, RagLearner) {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Arc::new(RagCorpus::new(dir.path().join("corpus.sqlite")));
        corpus.init().await.unwrap();
        let learner = RagLearner::new(corpus.clone(), Arc::new(StubEmbedder));
        (dir, corpus, learner)
    }

    #[test]
    fn test_composite_single_expert_rating_is_unbiased() {
        let ratings = Ratings {
            expert: Some(5),
            user_vote: None,
            llm: None,
        };
        assert_eq!(ratings.composite(), Some(5.0));
    }

    #[test]
    fn test_composite_all_three_weights_sum_to_one() {
        let ratings = Ratings {
            expert: Some(5),
            user_vote: Some(UserVote::Like),
            llm: Some(5.0),
        };
        assert_eq!(ratings.composite(), Some(5.0));

        let mixed = Ratings {
            expert: Some(5),
            user_vote: Some(UserVote::Dislike),
            llm: Some(3.0),
        };
        // (5*0.5 + 3*0.3 + 1*0.2) / 1.0 = 3.6
        assert_eq!(mixed.composite(), Some(3.6));
    }

    #[test]
    fn test_composite_none_vote_is_ignored() {
        let ratings = Ratings {
            expert: Some(4),
            user_vote: Some(UserVote::None),
            llm: None,
        };
        assert_eq!(ratings.composite(), Some(4.0));
    }

    #[test]
    fn test_composite_absent_everything_is_none() {
        assert_eq!(Ratings::default().composite(), None);
    }

    #[test]
    fn test_quality_score_caps() {
        let q = quality_score("最近7天访问量是多少？", GOOD_SQL, GOOD_ANSWER);
        assert!(q >= 0.7, "expected gate pass, got {}", q);
        assert!(q <= 1.0);

        let bad = quality_score("x", "DROP TABLE t", "");
        assert!(bad < 0.3, "expected low quality, got {}", bad);
    }

    #[test]
    fn test_clean_sql_strips_fences() {
        let raw = "```sql\nSELECT a FROM t;\n```";
        assert_eq!(clean_sql(raw).unwrap(), "SELECT a FROM t");
        assert!(clean_sql("no sql at all").is_none());
    }

    #[tokio::test]
    async fn test_expert_five_alone_is_stored() {
        let (_dir, _corpus, learner) = learner().await;
        let outcome = learner
            .learn(
                "c1",
                "最近7天访问量是多少？",
                Some(GOOD_SQL),
                GOOD_ANSWER,
                Ratings {
                    expert: Some(5),
                    user_vote: None,
                    llm: None,
                },
                "expert",
            )
            .await
            .unwrap();
        assert!(matches!(outcome, LearnOutcome::Stored(_)));
    }

    #[tokio::test]
    async fn test_near_duplicate_merges_into_one_row() {
        let (_dir, corpus, learner) = learner().await;
        let ratings = Ratings {
            expert: Some(5),
            user_vote: None,
            llm: None,
        };

        let first = learner
            .learn("c1", "最近7天访问量是多少？", Some(GOOD_SQL), GOOD_ANSWER, ratings, "expert")
            .await
            .unwrap();
        let LearnOutcome::Stored(id) = first else {
            panic!("expected stored, got {:?}", first);
        };

        // Same leading character: the stub embedder produces a nearly
        // identical vector, well above the dedup threshold.
        let second = learner
            .learn("c2", "最近7天访问量是多少呢？", Some(GOOD_SQL), GOOD_ANSWER, ratings, "expert")
            .await
            .unwrap();
        assert_eq!(second, LearnOutcome::Updated(id.clone()));

        let stats = corpus.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        let stored = corpus.get(id).await.unwrap().unwrap();
        assert_eq!(stored.usage_count, 1);
        assert_eq!(stored.score, 5.0);
    }

    #[tokio::test]
    async fn test_rating_twice_is_idempotent_on_the_corpus() {
        let (_dir, corpus, learner) = learner().await;
        let ratings = Ratings {
            expert: Some(5),
            user_vote: None,
            llm: None,
        };
        let question = "最近7天访问量是多少？";

        learner
            .learn("c1", question, Some(GOOD_SQL), GOOD_ANSWER, ratings, "expert")
            .await
            .unwrap();
        let second = learner
            .learn("c1", question, Some(GOOD_SQL), GOOD_ANSWER, ratings, "expert")
            .await
            .unwrap();

        assert!(matches!(second, LearnOutcome::Updated(_)));
        assert_eq!(corpus.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_low_ratings_are_skipped() {
        let (_dir, corpus, learner) = learner().await;
        let outcome = learner
            .learn(
                "c1",
                "最近7天访问量是多少？",
                Some(GOOD_SQL),
                GOOD_ANSWER,
                Ratings {
                    expert: Some(3),
                    user_vote: None,
                    llm: None,
                },
                "feedback",
            )
            .await
            .unwrap();
        assert!(matches!(outcome, LearnOutcome::Skipped(_)));
        assert_eq!(corpus.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_no_ratings_is_skipped() {
        let (_dir, _corpus, learner) = learner().await;
        let outcome = learner
            .learn("c1", "q", Some(GOOD_SQL), GOOD_ANSWER, Ratings::default(), "auto")
            .await
            .unwrap();
        assert_eq!(outcome, LearnOutcome::Skipped("no ratings present"));
    }
}
