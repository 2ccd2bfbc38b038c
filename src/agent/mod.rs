//! Tool-driven agent loop.
//!
//! Drives the LLM with the tool catalogue until it produces a final
//! answer, a budget runs out, or the client goes away. Tool calls run
//! strictly sequentially; failures are surfaced to the LLM as tool
//! errors rather than aborting the loop.

mod permissions;

pub use permissions::ToolPermissionManager;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::conversation::{ChartSpec, ToolCallRecord};
use crate::events::ChatEvent;
use crate::knowledge::UserGroup;
use crate::llm::{
    ChunkStream, LlmChunk, LlmDriver, LlmRequest, Message, ToolCall, ToolCallAccumulator,
};
use crate::orchestrator::EventSink;
use crate::tools::{ToolContext, ToolRegistry};

/// Characters of a tool observation kept in the persisted summary.
const RESULT_SUMMARY_CHARS: usize = 200;

/// Outcome of one agent run.
#[derive(Debug, Default)]
pub struct AgentOutcome {
    /// Concatenated visible assistant text.
    pub final_text: String,
    /// SQL from the last successful `run_sql`.
    pub sql: Option<String>,
    /// Artifact hash from the last successful `run_sql`.
    pub file_hash: Option<String>,
    /// Chart descriptor from the last `visualize_data`.
    pub chart: Option<ChartSpec>,
    /// Whether any statement was rejected by the SQL guard.
    pub sql_rejected: bool,
    /// Whether the wall-clock deadline cut the loop short.
    pub deadline_hit: bool,
    /// Whether the client went away mid-run.
    pub aborted: bool,
    /// Every tool invocation, in execution order.
    pub tool_records: Vec<ToolCallRecord>,
}

/// The agent loop runtime.
pub struct AgentLoop {
    driver: Arc<dyn LlmDriver>,
    tools: Arc<ToolRegistry>,
    permissions: Arc<ToolPermissionManager>,
    max_iterations: usize,
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("max_iterations", &self.max_iterations)
            .field("tools", &self.tools.list_tools())
            .finish()
    }
}

impl AgentLoop {
    /// Create an agent loop.
    pub fn new(
        driver: Arc<dyn LlmDriver>,
        tools: Arc<ToolRegistry>,
        permissions: Arc<ToolPermissionManager>,
        max_iterations: usize,
    ) -> Self {
        Self {
            driver,
            tools,
            permissions,
            max_iterations,
        }
    }

    /// Tool registry backing this loop.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run the loop over a prepared transcript, streaming events into the
    /// sink. Returns when the model produces a final answer or a budget
    /// is exhausted.
    pub async fn run(
        &self,
        mut conversation: Vec<Message>,
        group: UserGroup,
        ctx: ToolContext,
        sink: &EventSink,
    ) -> AgentOutcome {
        let mut outcome = AgentOutcome::default();
        let tool_schemas = self.tools.get_tool_schemas();

        for iteration in 0..self.max_iterations {
            if sink.is_closed() {
                outcome.aborted = true;
                return outcome;
            }
            if Instant::now() >= ctx.deadline {
                outcome.deadline_hit = true;
                sink.send(ChatEvent::error(
                    "deadline_exceeded",
                    "the request ran out of time budget",
                ))
                .await;
                return outcome;
            }

            // One LLM round-trip, retried once on upstream failure.
            let stream = match self.open_stream(&conversation, &tool_schemas).await {
                Ok(stream) => stream,
                Err(e) => {
                    sink.send(ChatEvent::error("upstream_error", e.to_string())).await;
                    return outcome;
                }
            };

            let round = self.collect_round(stream, sink, &mut outcome).await;

            if round.tool_calls.is_empty() {
                // Final text answer.
                return outcome;
            }

            conversation.push(Message {
                role: crate::llm::MessageRole::Assistant,
                content: round.text,
                tool_call_id: None,
                tool_calls: Some(round.tool_calls.clone()),
            });

            for call in round.tool_calls {
                let observation = self
                    .dispatch(&call, group, &ctx, sink, &mut outcome)
                    .await;
                conversation.push(Message::tool_result(call.id, observation));
            }

            tracing::debug!(iteration, "agent iteration complete");
        }

        sink.send(ChatEvent::error(
            "internal_error",
            format!("maximum tool iterations ({}) exceeded", self.max_iterations),
        ))
        .await;
        outcome
    }

    async fn open_stream(
        &self,
        conversation: &[Message],
        tool_schemas: &[serde_json::Value],
    ) -> anyhow::Result<ChunkStream> {
        let request = || {
            LlmRequest::new(conversation.to_vec()).with_tools(tool_schemas.to_vec())
        };
        match self.driver.stream(request()).await {
            Ok(stream) => Ok(stream),
            Err(first) => {
                tracing::warn!(error = %first, "LLM call failed, retrying once");
                self.driver.stream(request()).await
            }
        }
    }

    /// Drain one response stream, forwarding text deltas and accumulating
    /// tool call fragments.
    async fn collect_round(
        &self,
        mut stream: ChunkStream,
        sink: &EventSink,
        outcome: &mut AgentOutcome,
    ) -> Round {
        let mut round = Round::default();
        let mut accumulators: BTreeMap<usize, ToolCallAccumulator> = BTreeMap::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LlmChunk::TextDelta(delta)) => {
                    round.text.push_str(&delta);
                    outcome.final_text.push_str(&delta);
                    sink.send(ChatEvent::text_delta(delta)).await;
                }
                Ok(LlmChunk::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                }) => {
                    accumulators
                        .entry(index)
                        .or_default()
                        .apply_delta(id, name, arguments);
                }
                Ok(LlmChunk::Done { .. }) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "stream chunk error");
                }
            }
        }

        round.tool_calls = accumulators
            .into_values()
            .filter_map(ToolCallAccumulator::into_tool_call)
            .collect();
        round
    }

    /// Dispatch one tool call: permission check, execution, events, and
    /// the observation string for the LLM.
    async fn dispatch(
        &self,
        call: &ToolCall,
        group: UserGroup,
        ctx: &ToolContext,
        sink: &EventSink,
        outcome: &mut AgentOutcome,
    ) -> String {
        let name = &call.function.name;
        let arguments: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);

        sink.send(ChatEvent::ToolCall {
            id: call.id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        })
        .await;

        if let Err(reason) = self.permissions.check(group, name) {
            sink.send(ChatEvent::error("permission_denied", reason.clone())).await;
            outcome.tool_records.push(ToolCallRecord {
                tool_name: name.clone(),
                arguments,
                result_summary: reason.clone(),
                success: false,
            });
            return format!("Tool error: {}", reason);
        }

        match self.tools.execute(name, &call.function.arguments, ctx).await {
            Ok(output) => {
                for event in &output.events {
                    if let ChatEvent::Chart {
                        chart_type,
                        x_key,
                        y_key,
                        title,
                        ..
                    } = event
                    {
                        outcome.chart = Some(ChartSpec {
                            chart_type: *chart_type,
                            x_key: x_key.clone(),
                            y_key: y_key.clone(),
                            title: title.clone(),
                        });
                    }
                    sink.send(event.clone()).await;
                }
                if let Some(sql) = &output.sql {
                    outcome.sql = Some(sql.clone());
                }
                if let Some(hash) = &output.file_hash {
                    outcome.file_hash = Some(hash.clone());
                }
                outcome.tool_records.push(ToolCallRecord {
                    tool_name: name.clone(),
                    arguments,
                    result_summary: truncate(&output.content, RESULT_SUMMARY_CHARS),
                    success: true,
                });
                output.content
            }
            Err(e) => {
                let message = e.to_string();
                let code = if message.contains("SQL rejected") {
                    outcome.sql_rejected = true;
                    "validation_error"
                } else {
                    "upstream_error"
                };
                sink.send(ChatEvent::error(code, message.clone())).await;
                outcome.tool_records.push(ToolCallRecord {
                    tool_name: name.clone(),
                    arguments,
                    result_summary: truncate(&message, RESULT_SUMMARY_CHARS),
                    success: false,
                });
                format!("Tool error: {}", message)
            }
        }
    }
}

#[derive(Default)]
struct Round {
    text: String,
    tool_calls: Vec<ToolCall>,
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
