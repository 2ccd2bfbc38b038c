//! System prompt composition.
//!
//! Interpolates the active prompt version with the schema summary, the
//! glossary, the selected exemplars, and a per-user personalization
//! block. Composed prompts are cached LRU by prompt version, user, and
//! analysis fingerprint.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::analyzer::Analysis;
use crate::executor::TableSchema;
use crate::fewshot::{format_exemplars, Exemplar};
use crate::knowledge::{ExpertiseLevel, KnowledgeStore, UserProfile};

/// Bound on cached composed prompts.
const COMPOSER_CACHE_SIZE: usize = 200;

/// LRU cache keyed by `(prompt_version_id, user_id, analysis_fingerprint)`.
struct ComposerCache {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl ComposerCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        let value = self.map.get(key).cloned()?;
        // Move to the back: most recently used.
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key.to_string());
        }
        Some(value)
    }

    fn put(&mut self, key: String, value: String) {
        if self.map.contains_key(&key) {
            self.map.insert(key.clone(), value);
            if let Some(pos) = self.order.iter().position(|k| *k == key) {
                self.order.remove(pos);
            }
            self.order.push_back(key);
            return;
        }
        if self.order.len() >= COMPOSER_CACHE_SIZE {
            if let Some(lru) = self.order.pop_front() {
                self.map.remove(&lru);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// The prompt composer.
pub struct PromptComposer {
    knowledge: Arc<KnowledgeStore>,
    cache: Mutex<ComposerCache>,
}

impl PromptComposer {
    /// Create a composer.
    pub fn new(knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            knowledge,
            cache: Mutex::new(ComposerCache::new()),
        }
    }

    /// Compose the system prompt for one request.
    pub async fn compose(
        &self,
        profile: &UserProfile,
        analysis: &Analysis,
        exemplars: &[Exemplar],
        schemas: &[TableSchema],
    ) -> String {
        let active = self
            .knowledge
            .active_prompt("system_prompt".to_string())
            .await
            .ok()
            .flatten();

        let (version_id, template) = match active {
            Some(prompt) => (prompt.id, prompt.content),
            None => (
                0,
                crate::knowledge::store::DEFAULT_SYSTEM_PROMPT.to_string(),
            ),
        };

        let cache_key = format!(
            "{}|{}|{}",
            version_id,
            profile.user_id,
            analysis.fingerprint()
        );
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            return cached;
        }

        let schema_summary = schema_summary(analysis, schemas);
        let glossary = glossary(analysis);
        let personalization = personalization_block(profile);

        let prompt = template
            .replace("{schema_summary}", &schema_summary)
            .replace("{glossary}", &glossary)
            .replace("{exemplars}", &format_exemplars(exemplars))
            .replace("{personalization}", &personalization);

        self.cache.lock().put(cache_key, prompt.clone());
        prompt
    }

    /// Number of cached prompts.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Schema section: the chosen tables with their columns, or every known
/// table when selection found nothing.
fn schema_summary(analysis: &Analysis, schemas: &[TableSchema]) -> String {
    let chosen: Vec<&TableSchema> = if analysis.candidate_tables.is_empty() {
        schemas.iter().collect()
    } else {
        schemas
            .iter()
            .filter(|s| {
                analysis
                    .candidate_tables
                    .iter()
                    .any(|c| c.name == s.name)
            })
            .collect()
    };

    if chosen.is_empty() {
        return "(no tables registered)".to_string();
    }
    chosen
        .iter()
        .map(|s| s.describe())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Glossary section from the matched knowledge items.
fn glossary(analysis: &Analysis) -> String {
    if analysis.relevant_knowledge.is_empty() {
        return "(none)".to_string();
    }
    analysis
        .relevant_knowledge
        .iter()
        .map(|item| match &item.value {
            Some(value) => format!("- {}: {} ({})", item.keyword, item.description, value),
            None => format!("- {}: {}", item.keyword, item.description),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Personalization block tuned by expertise, chart preference, and focus
/// dimensions.
fn personalization_block(profile: &UserProfile) -> String {
    let mut parts: Vec<String> = Vec::new();

    match profile.expertise_level {
        ExpertiseLevel::Beginner => {
            parts.push(
                "The user is new to data analysis: explain each step in plain \
                 language and avoid jargon."
                    .to_string(),
            );
        }
        ExpertiseLevel::Intermediate => {}
        ExpertiseLevel::Expert => {
            parts.push(
                "The user is an expert: answer tersely, lead with the numbers, \
                 skip explanations of basic concepts."
                    .to_string(),
            );
        }
    }

    if let Some(chart) = &profile.preferred_chart {
        parts.push(format!(
            "Prefer {} charts when the data shape allows it.",
            chart
        ));
    }

    if !profile.focus_dimensions.is_empty() {
        parts.push(format!(
            "The user most often analyzes by: {}.",
            profile.focus_dimensions.join(", ")
        ));
    }

    if parts.is_empty() {
        String::new()
    } else {
        format!("User preferences:\n{}", parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tables::Feasibility;

    fn analysis() -> Analysis {
        Analysis {
            original_question: "最近7天访问量".into(),
            rewritten_question: "最近7天(具体窗口)的访问量".into(),
            semantic_tokens: Vec::new(),
            candidate_tables: Vec::new(),
            relevant_knowledge: vec![crate::knowledge::KnowledgeItem {
                kind: "term".into(),
                keyword: "访问量".into(),
                description: "visit count".into(),
                value: None,
            }],
            feasibility: Feasibility {
                can_answer: true,
                confidence: 0.7,
                reason: String::new(),
            },
            chart_hint: None,
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_compose_interpolates_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = Arc::new(KnowledgeStore::new(dir.path().join("k.sqlite")));
        knowledge.init().await.unwrap();
        let composer = PromptComposer::new(knowledge);

        let profile = UserProfile {
            expertise_level: ExpertiseLevel::Expert,
            preferred_chart: Some("line".into()),
            focus_dimensions: vec!["渠道".into()],
            ..UserProfile::guest("u1")
        };
        let schemas = vec![TableSchema {
            name: "gio_event".into(),
            columns: vec!["event_date".into(), "visits".into()],
            row_count: 100,
        }];

        let prompt = composer.compose(&profile, &analysis(), &[], &schemas).await;
        assert!(!prompt.contains("{schema_summary}"));
        assert!(!prompt.contains("{glossary}"));
        assert!(!prompt.contains("{exemplars}"));
        assert!(!prompt.contains("{personalization}"));
        assert!(prompt.contains("gio_event"));
        assert!(prompt.contains("访问量"));
        assert!(prompt.contains("tersely"));
        assert!(prompt.contains("渠道"));
    }

    #[tokio::test]
    async fn test_compose_caches_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = Arc::new(KnowledgeStore::new(dir.path().join("k.sqlite")));
        knowledge.init().await.unwrap();
        let composer = PromptComposer::new(knowledge);

        let profile = UserProfile::guest("u1");
        let analysis = analysis();

        composer.compose(&profile, &analysis, &[], &[]).await;
        composer.compose(&profile, &analysis, &[], &[]).await;
        assert_eq!(composer.cache_len(), 1);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let mut cache = ComposerCache::new();
        for i in 0..COMPOSER_CACHE_SIZE {
            cache.put(format!("k{}", i), "v".into());
        }
        // Touch k0 so it is no longer the LRU entry.
        assert!(cache.get("k0").is_some());
        cache.put("overflow".into(), "v".into());

        assert!(cache.get("k0").is_some());
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.len(), COMPOSER_CACHE_SIZE);
    }
}
