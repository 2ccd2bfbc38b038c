//! OpenAI-compatible provider driver.
//!
//! Works against OpenAI and any API exposing the same chat completions
//! streaming protocol.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::llm::{ChunkStream, LlmChunk, LlmDriver, LlmRequest, LlmSettings, Message, MessageRole};

/// OpenAI-compatible API driver.
#[derive(Debug, Clone)]
pub struct OpenAiDriver {
    settings: LlmSettings,
    client: Client,
}

impl OpenAiDriver {
    /// Create a new driver.
    pub fn new(settings: LlmSettings) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self { settings, client }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                let mut obj = serde_json::json!({
                    "role": match msg.role {
                        MessageRole::System => "system",
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                        MessageRole::Tool => "tool",
                    },
                    "content": msg.content,
                });

                if let Some(ref tool_call_id) = msg.tool_call_id {
                    obj["tool_call_id"] = serde_json::Value::String(tool_call_id.clone());
                }
                if let Some(ref tool_calls) = msg.tool_calls {
                    obj["tool_calls"] = serde_json::to_value(tool_calls).unwrap_or_default();
                }

                obj
            })
            .collect()
    }
}

#[async_trait]
impl LlmDriver for OpenAiDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<ChunkStream> {
        let temperature = req.temperature.unwrap_or(self.settings.temperature);
        let max_tokens = req.max_tokens.unwrap_or(self.settings.max_tokens);

        let mut body = serde_json::json!({
            "model": self.settings.model,
            "messages": Self::convert_messages(&req.messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
        });

        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools.clone());
        }

        let mut request = self.client.post(self.api_url()).json(&body);
        if let Some(ref api_key) = self.settings.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error ({}): {}", status, text);
        }

        let stream = response.bytes_stream();

        let chunk_stream = async_stream::stream! {
            let mut buffer = String::new();

            futures::pin_mut!(stream);

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(anyhow::anyhow!("Stream error: {}", e));
                        continue;
                    }
                };

                let chunk_str = match std::str::from_utf8(&chunk) {
                    Ok(s) => s,
                    Err(e) => {
                        yield Err(anyhow::anyhow!("UTF-8 error: {}", e));
                        continue;
                    }
                };

                buffer.push_str(chunk_str);

                // Process complete SSE frames
                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for data_line in frame.lines() {
                        if let Some(data) = data_line.strip_prefix("data: ") {
                            if data.trim() == "[DONE]" {
                                yield Ok(LlmChunk::Done { finish_reason: None });
                                continue;
                            }

                            match serde_json::from_str::<StreamChunk>(data) {
                                Ok(chunk) => {
                                    for event in chunk.into_chunks() {
                                        yield Ok(event);
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Failed to parse chunk: {} - {}", e, data);
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(chunk_stream))
    }
}

/// Streaming response chunk in the provider's wire format.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl StreamChunk {
    fn into_chunks(self) -> Vec<LlmChunk> {
        let mut chunks = Vec::new();

        if let Some(choices) = self.choices {
            for choice in choices {
                if let Some(delta) = choice.delta {
                    if let Some(content) = delta.content {
                        if !content.is_empty() {
                            chunks.push(LlmChunk::TextDelta(content));
                        }
                    }

                    if let Some(tool_calls) = delta.tool_calls {
                        for tc in tool_calls {
                            chunks.push(LlmChunk::ToolCallDelta {
                                index: tc.index,
                                id: tc.id,
                                name: tc.function.as_ref().and_then(|f| f.name.clone()),
                                arguments: tc.function.and_then(|f| f.arguments),
                            });
                        }
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    chunks.push(LlmChunk::Done {
                        finish_reason: Some(reason),
                    });
                }
            }
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_delta_chunk() {
        let raw = r#"{"choices":[{"delta":{"content":"你好"},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(raw).unwrap();
        let chunks = chunk.into_chunks();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], LlmChunk::TextDelta(s) if s == "你好"));
    }

    #[test]
    fn test_parse_tool_call_chunk() {
        let raw = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"run_sql","arguments":"{\"sql"}}]},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(raw).unwrap();
        let chunks = chunk.into_chunks();
        assert!(matches!(
            &chunks[0],
            LlmChunk::ToolCallDelta { index: 0, id: Some(id), name: Some(name), .. }
                if id == "call_1" && name == "run_sql"
        ));
    }

    #[test]
    fn test_finish_reason_yields_done() {
        let raw = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk: StreamChunk = serde_json::from_str(raw).unwrap();
        let chunks = chunk.into_chunks();
        assert!(matches!(
            &chunks[0],
            LlmChunk::Done { finish_reason: Some(r) } if r == "stop"
        ));
    }
}
