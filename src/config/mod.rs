//! Configuration management for the ChatBI API.
//!
//! Configuration is loaded from defaults, an optional config file, and
//! environment variables, in that order. Provider secrets and filesystem
//! paths come from explicit environment variables so deployments never
//! need a config file at all.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmProviderConfig,
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Storage paths.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Agent loop budgets.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmProviderConfig::default(),
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from config files and environment variables.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("llm.model", "gpt-4o")?
            .set_default("llm.max_tokens", 4096)?
            .set_default("llm.temperature", 0.1)?
            .add_source(config::File::with_name("config/chatbi").required(false))
            .add_source(
                config::Environment::with_prefix("CHATBI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        // Provider endpoints and secrets
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            app_config.llm.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            app_config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            app_config.llm.model = model;
        }
        if let Ok(url) = std::env::var("EMBEDDER_BASE_URL") {
            app_config.embedding.base_url = url;
        }
        if let Ok(key) = std::env::var("EMBEDDER_API_KEY") {
            app_config.embedding.api_key = Some(key);
        }
        if app_config.embedding.api_key.is_none() {
            app_config.embedding.api_key = app_config.llm.api_key.clone();
        }

        // Storage paths
        if let Ok(dir) = std::env::var("CHATBI_DATA_DIR") {
            app_config.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CHATBI_ARTIFACT_DIR") {
            app_config.storage.artifact_dir = PathBuf::from(dir);
        }

        Ok(app_config)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds (outer middleware bound, not the
    /// per-request agent deadline).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Base URL for the OpenAI-compatible API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// API key.
    pub api_key: Option<String>,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.1
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL for the embeddings API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// API key (falls back to the LLM key when unset).
    pub api_key: Option<String>,
    /// Embedding model identifier.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Vector dimensionality.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    1536
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_dimensions(),
        }
    }
}

/// Storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the durable stores (knowledge, logs, corpus)
    /// and the queryable data database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding CSV artifacts keyed by file hash.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./data/artifacts")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

/// Agent loop budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool loop iterations per request.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Hard wall-clock deadline per request, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Event channel capacity between producer and network writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_iterations() -> usize {
    8
}

fn default_deadline_secs() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            deadline_secs: default_deadline_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to use JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.agent.max_iterations, 8);
        assert_eq!(config.agent.deadline_secs, 60);
        assert_eq!(config.agent.channel_capacity, 256);
        assert_eq!(config.server.port, 8080);
    }
}
