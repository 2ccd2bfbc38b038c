//! Question rewriting.
//!
//! A single LLM call normalizes the question: pronouns are resolved from
//! the previous turn, field aliases expand to canonical names, and time
//! expressions become explicit. Results are cached FIFO by a fingerprint
//! of the question, the user, and the previous turn, so repeated
//! questions skip the round-trip. Rewriting never fails the request: on
//! any error the original question is used as its own rewrite.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::knowledge::{KnowledgeSnapshot, KnowledgeStore};
use crate::llm::{LlmDriver, LlmRequest, Message};

/// Bound on cached rewrites; oldest entries are evicted first.
const REWRITE_CACHE_SIZE: usize = 100;

/// FIFO cache from rewrite fingerprint to rewritten question.
pub struct RewriteCache {
    inner: Mutex<RewriteCacheInner>,
}

struct RewriteCacheInner {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl RewriteCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RewriteCacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Look up a cached rewrite.
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        self.inner.lock().map.get(fingerprint).cloned()
    }

    /// Insert a rewrite, evicting the oldest entry when full.
    pub fn put(&self, fingerprint: String, rewritten: String) {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&fingerprint) {
            inner.map.insert(fingerprint, rewritten);
            return;
        }
        if inner.order.len() >= REWRITE_CACHE_SIZE {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
        inner.order.push_back(fingerprint.clone());
        inner.map.insert(fingerprint, rewritten);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RewriteCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Fingerprint for the rewrite cache: lowercased question, user id, and a
/// digest of the previous turn.
pub fn rewrite_fingerprint(question: &str, user_id: &str, last_turn: Option<&str>) -> String {
    let turn_hash = match last_turn {
        Some(turn) => hex::encode(&Sha256::digest(turn.as_bytes())[..8]),
        None => "none".to_string(),
    };
    format!("{}|{}|{}", question.trim().to_lowercase(), user_id, turn_hash)
}

/// LLM-backed question rewriter.
pub struct Rewriter {
    driver: Arc<dyn LlmDriver>,
    knowledge: Arc<KnowledgeStore>,
    cache: RewriteCache,
}

impl Rewriter {
    /// Create a rewriter.
    pub fn new(driver: Arc<dyn LlmDriver>, knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            driver,
            knowledge,
            cache: RewriteCache::new(),
        }
    }

    /// Rewrite a question, consulting the cache first. Degrades to the
    /// original question on provider failure.
    pub async fn rewrite(
        &self,
        question: &str,
        user_id: &str,
        last_turn: Option<&str>,
        snapshot: &KnowledgeSnapshot,
    ) -> (String, bool) {
        let fingerprint = rewrite_fingerprint(question, user_id, last_turn);
        if let Some(cached) = self.cache.get(&fingerprint) {
            return (cached, false);
        }

        let template = self
            .knowledge
            .active_prompt_content(
                "rewrite_prompt",
                crate::knowledge::store::DEFAULT_REWRITE_PROMPT,
            )
            .await;

        let aliases = snapshot
            .field_mappings
            .iter()
            .map(|m| format!("- {} -> {}", m.display_name, m.describe()))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = template
            .replace("{context}", last_turn.unwrap_or("(first turn)"))
            .replace("{aliases}", if aliases.is_empty() { "(none)" } else { &aliases })
            .replace("{question}", question);

        let request =
            LlmRequest::new(vec![Message::user(prompt)]).with_temperature(0.1);

        match self.driver.complete(request).await {
            Ok(text) => {
                let rewritten = text.trim().to_string();
                if rewritten.is_empty() {
                    (question.to_string(), true)
                } else {
                    self.cache.put(fingerprint, rewritten.clone());
                    (rewritten, false)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "question rewrite failed, using raw question");
                (question.to_string(), true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_is_fifo_bounded() {
        let cache = RewriteCache::new();
        for i in 0..(REWRITE_CACHE_SIZE + 10) {
            cache.put(format!("key-{}", i), format!("value-{}", i));
        }
        assert_eq!(cache.len(), REWRITE_CACHE_SIZE);
        // The first entries were evicted in insertion order.
        assert!(cache.get("key-0").is_none());
        assert!(cache.get("key-9").is_none());
        assert!(cache.get("key-10").is_some());
    }

    #[test]
    fn test_cache_update_does_not_duplicate() {
        let cache = RewriteCache::new();
        cache.put("k".into(), "v1".into());
        cache.put("k".into(), "v2".into());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }

    #[test]
    fn test_fingerprint_varies_by_context() {
        let base = rewrite_fingerprint("最近的访问量", "u1", None);
        assert_eq!(base, rewrite_fingerprint("  最近的访问量 ", "u1", None));
        assert_ne!(base, rewrite_fingerprint("最近的访问量", "u2", None));
        assert_ne!(
            base,
            rewrite_fingerprint("最近的访问量", "u1", Some("上一轮"))
        );
    }
}
