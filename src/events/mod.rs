//! Normalized streaming event model.
//!
//! Every partial result sent to a client is one of a closed set of event
//! kinds. The wire encoding follows the `rich`/`simple` envelope consumed
//! by the chat frontend; unknown kinds are rejected at the decode boundary
//! while unknown fields inside payloads are carried through untouched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of leading characters of a delta used as its dedup key.
const DEDUP_KEY_CHARS: usize = 50;

/// Status of a reasoning step shown in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step is in progress.
    Running,
    /// Step finished successfully.
    Done,
    /// Step failed; the stream may continue degraded.
    Error,
}

/// Chart kinds the visualizer can suggest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    /// Time-series line chart.
    #[default]
    Line,
    /// Categorical bar chart.
    Bar,
    /// Share-of-whole pie chart.
    Pie,
    /// Raw table, no chart.
    Table,
}

/// A normalized streaming event within one chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Conversation identifier; always the first event of a stream.
    ConversationId {
        /// The conversation this stream belongs to.
        conversation_id: String,
    },

    /// Progress of a named pipeline stage.
    ReasoningStep {
        /// Monotonic step number within the request.
        step: u32,
        /// Human-readable stage title.
        title: String,
        /// Current status.
        status: StepStatus,
        /// Optional detail (result summary or error hint).
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Partial assistant text.
    TextDelta {
        /// The content delta.
        content: String,
    },

    /// A tool invocation surfaced to the client.
    ToolCall {
        /// Tool call ID.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments as parsed JSON.
        arguments: serde_json::Value,
    },

    /// A tabular result descriptor. The full rows live in the artifact
    /// store under `file_hash`.
    Dataframe {
        /// Artifact hash of the CSV holding the full rows.
        file_hash: String,
        /// Total row count.
        row_count: usize,
        /// Column names.
        columns: Vec<String>,
        /// First rows for inline display.
        preview: Vec<Vec<serde_json::Value>>,
    },

    /// A chart descriptor derived from a dataframe.
    Chart {
        /// Suggested chart type.
        chart_type: ChartType,
        /// Column for the X axis.
        x_key: String,
        /// Column for the Y axis.
        y_key: String,
        /// Chart title.
        title: String,
        /// Dataframe this chart is derived from.
        #[serde(skip_serializing_if = "Option::is_none")]
        file_hash: Option<String>,
    },

    /// A terminal or recoverable error surfaced to the client.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// User-visible message.
        message: String,
    },

    /// Stream end marker; encoded as the `[DONE]` sentinel on the wire.
    Done,
}

impl ChatEvent {
    /// Create a text delta event.
    pub fn text_delta(content: impl Into<String>) -> Self {
        Self::TextDelta {
            content: content.into(),
        }
    }

    /// Create an error event.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a reasoning step event.
    pub fn step(step: u32, title: impl Into<String>, status: StepStatus) -> Self {
        Self::ReasoningStep {
            step,
            title: title.into(),
            status,
            detail: None,
        }
    }

    /// Create a reasoning step event with detail text.
    pub fn step_with_detail(
        step: u32,
        title: impl Into<String>,
        status: StepStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self::ReasoningStep {
            step,
            title: title.into(),
            status,
            detail: Some(detail.into()),
        }
    }

    /// Whether the event may be dropped under backpressure. Only plain
    /// text deltas qualify; structured events must always be delivered.
    pub fn droppable(&self) -> bool {
        matches!(self, Self::TextDelta { .. })
    }

    /// Dedup key for delta suppression: the first 50 characters of the
    /// trimmed content. Only text deltas carry one.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Self::TextDelta { content } => {
                Some(content.trim().chars().take(DEDUP_KEY_CHARS).collect())
            }
            _ => None,
        }
    }

    /// Encode to the wire envelope consumed by the chat frontend.
    ///
    /// `Done` has no JSON body; the transport emits the `[DONE]` sentinel
    /// line instead.
    pub fn to_wire(&self) -> Option<serde_json::Value> {
        match self {
            Self::ConversationId { conversation_id } => Some(serde_json::json!({
                "conversationId": conversation_id,
            })),
            Self::TextDelta { content } => {
                let mut obj = serde_json::json!({
                    "simple": { "text": content },
                });
                if let Some(key) = self.dedup_key() {
                    obj["dedupKey"] = serde_json::Value::String(key);
                }
                Some(obj)
            }
            Self::ReasoningStep {
                step,
                title,
                status,
                detail,
            } => Some(rich(
                "reasoning_step",
                serde_json::json!({
                    "step": step,
                    "title": title,
                    "status": status,
                    "detail": detail,
                }),
            )),
            Self::ToolCall {
                id,
                name,
                arguments,
            } => Some(rich(
                "tool_call",
                serde_json::json!({
                    "id": id,
                    "name": name,
                    "arguments": arguments,
                }),
            )),
            Self::Dataframe {
                file_hash,
                row_count,
                columns,
                preview,
            } => Some(rich(
                "dataframe",
                serde_json::json!({
                    "fileHash": file_hash,
                    "rowCount": row_count,
                    "columns": columns,
                    "preview": preview,
                }),
            )),
            Self::Chart {
                chart_type,
                x_key,
                y_key,
                title,
                file_hash,
            } => Some(rich(
                "chart",
                serde_json::json!({
                    "type": chart_type,
                    "xKey": x_key,
                    "yKey": y_key,
                    "title": title,
                    "fileHash": file_hash,
                }),
            )),
            Self::Error { code, message } => Some(rich(
                "error",
                serde_json::json!({
                    "code": code,
                    "message": message,
                }),
            )),
            Self::Done => None,
        }
    }

    /// Decode a wire envelope. Unknown rich kinds are an error; unknown
    /// fields inside a known payload are ignored.
    pub fn from_wire(value: &serde_json::Value) -> anyhow::Result<Self> {
        if let Some(id) = value.get("conversationId").and_then(|v| v.as_str()) {
            return Ok(Self::ConversationId {
                conversation_id: id.to_string(),
            });
        }
        if let Some(simple) = value.get("simple") {
            let text = simple
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("simple event without text"))?;
            return Ok(Self::text_delta(text));
        }
        let rich = value
            .get("rich")
            .ok_or_else(|| anyhow::anyhow!("event is neither simple nor rich"))?;
        let kind = rich
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("rich event without type"))?;
        let data = rich.get("data").cloned().unwrap_or_default();
        match kind {
            "reasoning_step" => Ok(Self::ReasoningStep {
                step: data["step"].as_u64().unwrap_or(0) as u32,
                title: data["title"].as_str().unwrap_or_default().to_string(),
                status: serde_json::from_value(data["status"].clone())
                    .unwrap_or(StepStatus::Running),
                detail: data["detail"].as_str().map(String::from),
            }),
            "tool_call" => Ok(Self::ToolCall {
                id: data["id"].as_str().unwrap_or_default().to_string(),
                name: data["name"].as_str().unwrap_or_default().to_string(),
                arguments: data["arguments"].clone(),
            }),
            "dataframe" => Ok(Self::Dataframe {
                file_hash: data["fileHash"].as_str().unwrap_or_default().to_string(),
                row_count: data["rowCount"].as_u64().unwrap_or(0) as usize,
                columns: serde_json::from_value(data["columns"].clone()).unwrap_or_default(),
                preview: serde_json::from_value(data["preview"].clone()).unwrap_or_default(),
            }),
            "chart" => Ok(Self::Chart {
                chart_type: serde_json::from_value(data["type"].clone()).unwrap_or_default(),
                x_key: data["xKey"].as_str().unwrap_or_default().to_string(),
                y_key: data["yKey"].as_str().unwrap_or_default().to_string(),
                title: data["title"].as_str().unwrap_or_default().to_string(),
                file_hash: data["fileHash"].as_str().map(String::from),
            }),
            "error" => Ok(Self::Error {
                code: data["code"].as_str().unwrap_or("internal_error").to_string(),
                message: data["message"].as_str().unwrap_or_default().to_string(),
            }),
            other => anyhow::bail!("unknown event kind: {}", other),
        }
    }
}

fn rich(kind: &str, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "rich": { "type": kind, "data": data },
    })
}

/// A stream event with ordering metadata.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Unique event ID.
    pub id: String,
    /// Sequence number, monotonic within one request.
    pub seq: u64,
    /// The event payload.
    pub event: ChatEvent,
    /// When the producer created the event.
    pub created_at: std::time::Instant,
}

impl StreamEvent {
    /// Create a new stream event.
    pub fn new(seq: u64, event: ChatEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            event,
            created_at: std::time::Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_takes_leading_chars() {
        let event = ChatEvent::text_delta("  今天的访问量明显上升，具体数据如下  ");
        let key = event.dedup_key().unwrap();
        assert_eq!(key, "今天的访问量明显上升，具体数据如下");

        let long = "x".repeat(120);
        let key = ChatEvent::text_delta(&long).dedup_key().unwrap();
        assert_eq!(key.chars().count(), 50);
    }

    #[test]
    fn test_only_text_deltas_are_droppable() {
        assert!(ChatEvent::text_delta("hi").droppable());
        assert!(!ChatEvent::Done.droppable());
        assert!(!ChatEvent::error("internal_error", "boom").droppable());
        assert!(!ChatEvent::Dataframe {
            file_hash: "abc".into(),
            row_count: 1,
            columns: vec!["a".into()],
            preview: vec![],
        }
        .droppable());
    }

    #[test]
    fn test_wire_round_trip() {
        let events = vec![
            ChatEvent::ConversationId {
                conversation_id: "c-1".into(),
            },
            ChatEvent::text_delta("hello"),
            ChatEvent::step(1, "analyze", StepStatus::Running),
            ChatEvent::Dataframe {
                file_hash: "deadbeef".into(),
                row_count: 7,
                columns: vec!["date".into(), "visits".into()],
                preview: vec![vec!["2024-01-01".into(), 42.into()]],
            },
            ChatEvent::Chart {
                chart_type: ChartType::Line,
                x_key: "date".into(),
                y_key: "visits".into(),
                title: "访问量趋势".into(),
                file_hash: Some("deadbeef".into()),
            },
        ];
        for event in events {
            let wire = event.to_wire().unwrap();
            let decoded = ChatEvent::from_wire(&wire).unwrap();
            assert_eq!(
                serde_json::to_value(&decoded).unwrap(),
                serde_json::to_value(&event).unwrap()
            );
        }
    }

    #[test]
    fn test_unknown_rich_kind_rejected() {
        let wire = serde_json::json!({
            "rich": { "type": "status_bar_update", "data": {} },
        });
        assert!(ChatEvent::from_wire(&wire).is_err());
    }

    #[test]
    fn test_done_has_no_wire_body() {
        assert!(ChatEvent::Done.to_wire().is_none());
    }
}
