//! Embedding provider and similarity helpers.
//!
//! Text is converted to fixed-dimension vectors by an opaque provider;
//! retrieval is cosine top-K with an optional keyword-overlap re-rank.
//! When the provider is unavailable, callers fall back to keyword-only
//! similarity, so embedding failures never fail a request.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::config::EmbeddingConfig;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Convert text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Vector dimensionality.
    fn dimensions(&self) -> usize;
}

/// HTTP embedder speaking the OpenAI embeddings protocol.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    config: EmbeddingConfig,
    client: Client,
}

impl HttpEmbedder {
    /// Create a new HTTP embedder.
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/embeddings",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": text,
        });

        let mut request = self.client.post(self.api_url()).json(&body);
        if let Some(ref api_key) = self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, text);
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding API returned no vectors"))?;

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }
}

/// Cosine similarity between two vectors. Returns 0 when either is empty
/// or dimensions mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Jaccard keyword overlap between two texts, used to re-rank vector hits
/// and as the fallback similarity when no embeddings are available.
pub fn keyword_overlap(a: &str, b: &str) -> f32 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f32 / union.max(1) as f32
}

/// Tokenize for overlap scoring: whitespace-split words plus single CJK
/// characters, lowercased.
fn tokenize(text: &str) -> std::collections::HashSet<String> {
    let mut tokens = std::collections::HashSet::new();
    for word in text.to_lowercase().split_whitespace() {
        let mut ascii_run = String::new();
        for ch in word.chars() {
            if ch.is_ascii() {
                ascii_run.push(ch);
            } else {
                if !ascii_run.is_empty() {
                    tokens.insert(std::mem::take(&mut ascii_run));
                }
                tokens.insert(ch.to_string());
            }
        }
        if !ascii_run.is_empty() {
            tokens.insert(ascii_run);
        }
    }
    tokens
}

/// Serialize an embedding as little-endian f32 bytes for BLOB storage.
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding from little-endian f32 bytes.
pub fn deserialize_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.5, 0.5, 0.7];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_keyword_overlap_cjk() {
        let a = "最近7天的访问量";
        let b = "最近30天的访问量";
        let overlap = keyword_overlap(a, b);
        assert!(overlap > 0.5, "overlap was {}", overlap);
    }

    #[test]
    fn test_embedding_round_trip() {
        let embedding = vec![0.1f32, -2.5, 3.75];
        let bytes = serialize_embedding(&embedding);
        let decoded = deserialize_embedding(&bytes).unwrap();
        assert_eq!(embedding, decoded);
    }

    #[test]
    fn test_deserialize_rejects_ragged_bytes() {
        assert!(deserialize_embedding(&[1, 2, 3]).is_none());
        assert!(deserialize_embedding(&[]).is_none());
    }
}
