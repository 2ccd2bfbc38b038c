//! LLM driver abstraction.
//!
//! The [`LlmDriver`] trait defines the streaming interface the agent loop
//! and the analyzer's rewrite stage build on. The bundled implementation
//! speaks the OpenAI-compatible chat completions protocol; the provider is
//! otherwise opaque to the rest of the service.

pub mod providers;

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// LLM connection and model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL for the LLM API.
    pub base_url: String,
    /// API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Temperature for sampling.
    pub temperature: f32,
}

impl From<&crate::config::LlmProviderConfig> for LlmSettings {
    fn from(config: &crate::config::LlmProviderConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response.
    Assistant,
    /// Tool response.
    Tool,
}

/// A message in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    /// Text content of the message.
    pub content: String,
    /// Tool call ID (for tool responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls made by the assistant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create a tool response message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call.
    pub id: String,
    /// Type of tool (always "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function details.
    pub function: ToolCallFunction,
}

/// Function details in a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    /// Function name.
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

/// A streaming chunk from the LLM provider.
#[derive(Debug, Clone)]
pub enum LlmChunk {
    /// Partial assistant text.
    TextDelta(String),
    /// Partial tool call data keyed by index.
    ToolCallDelta {
        /// Tool call index within the response.
        index: usize,
        /// Tool call ID (may arrive on the first delta only).
        id: Option<String>,
        /// Tool name (may arrive on the first delta only).
        name: Option<String>,
        /// Arguments fragment (JSON string piece).
        arguments: Option<String>,
    },
    /// The provider finished the response.
    Done {
        /// Finish reason, when reported.
        finish_reason: Option<String>,
    },
}

/// Request to an LLM driver.
#[derive(Debug)]
pub struct LlmRequest {
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Available tools in OpenAI function schema format.
    pub tools: Vec<serde_json::Value>,
    /// Temperature (overrides settings).
    pub temperature: Option<f32>,
    /// Max tokens (overrides settings).
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Create a new request with messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Add tools to the request.
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Boxed chunk stream returned by drivers.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<LlmChunk>> + Send>>;

/// Trait for LLM streaming drivers.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Stream a response from the LLM.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<ChunkStream>;

    /// One-shot completion: collect the streamed text into a single string.
    ///
    /// Tool call fragments are ignored; this is used for auxiliary calls
    /// (question rewriting, table selection) that never carry tools.
    async fn complete(&self, req: LlmRequest) -> anyhow::Result<String> {
        let mut stream = self.stream(req).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let LlmChunk::TextDelta(delta) = chunk? {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }
}

/// Accumulator for streaming tool calls.
#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    /// Tool call ID.
    pub id: Option<String>,
    /// Tool name.
    pub name: Option<String>,
    /// Arguments accumulated so far.
    pub arguments: String,
}

impl ToolCallAccumulator {
    /// Apply a delta to this accumulator.
    pub fn apply_delta(
        &mut self,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) {
        if let Some(id) = id {
            self.id = Some(id);
        }
        if let Some(name) = name {
            self.name = Some(name);
        }
        if let Some(args) = arguments {
            self.arguments.push_str(&args);
        }
    }

    /// Convert to a complete tool call, if both ID and name arrived.
    pub fn into_tool_call(self) -> Option<ToolCall> {
        match (self.id, self.name) {
            (Some(id), Some(name)) => Some(ToolCall {
                id,
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name,
                    arguments: self.arguments,
                },
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_assembles_fragments() {
        let mut acc = ToolCallAccumulator::default();
        acc.apply_delta(Some("call_1".into()), Some("run_sql".into()), None);
        acc.apply_delta(None, None, Some("{\"sql\":".into()));
        acc.apply_delta(None, None, Some("\"SELECT 1\"}".into()));

        let call = acc.into_tool_call().unwrap();
        assert_eq!(call.function.name, "run_sql");
        assert_eq!(call.function.arguments, "{\"sql\":\"SELECT 1\"}");
    }

    #[test]
    fn test_accumulator_without_name_is_incomplete() {
        let mut acc = ToolCallAccumulator::default();
        acc.apply_delta(Some("call_1".into()), None, Some("{}".into()));
        assert!(acc.into_tool_call().is_none());
    }
}
