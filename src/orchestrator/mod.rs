//! Stream orchestration.
//!
//! One producer task per request runs the pipeline (analyze, retrieve,
//! compose, agent loop) and pushes ordered events into a bounded channel;
//! the network writer drains it. `conversation_id` is always first and
//! `done` always last, except on client cancellation where the stream
//! simply ends. Under backpressure, stale text deltas may be dropped;
//! structured events never are.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analyzer::AnalysisContext;
use crate::conversation::MessageExtra;
use crate::events::{ChatEvent, StepStatus, StreamEvent};
use crate::fewshot::DEFAULT_LIMIT;
use crate::knowledge::QueryHistoryEntry;
use crate::llm::Message;
use crate::tools::ToolContext;
use crate::AppState;

/// Buffer fill ratio above which stale text deltas are dropped.
const DROP_FILL_RATIO: f64 = 0.8;
/// Age past which a buffered text delta becomes droppable.
const DROP_AGE: Duration = Duration::from_millis(100);

/// Single-writer event sink over the bounded request channel.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    seq: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl EventSink {
    /// Create a sink over a channel with the given capacity.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                capacity,
            },
            rx,
        )
    }

    /// Whether the reader has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.tx.is_closed()
    }

    /// Send an event. Structured events block until there is room; text
    /// deltas may be dropped when the buffer is mostly full and the delta
    /// is stale. Returns false once the reader is gone.
    pub async fn send(&self, event: ChatEvent) -> bool {
        if self.is_closed() {
            return false;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let stream_event = StreamEvent::new(seq, event);

        if stream_event.event.droppable() {
            let fill = 1.0 - self.tx.capacity() as f64 / self.capacity as f64;
            if fill > DROP_FILL_RATIO && stream_event.created_at.elapsed() >= DROP_AGE {
                tracing::trace!(seq, "dropped stale text delta under backpressure");
                return true;
            }
        }

        match self.tx.send(stream_event).await {
            Ok(()) => true,
            Err(_) => {
                self.closed.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

/// Parameters of one chat request.
#[derive(Debug, Clone)]
pub struct ChatParams {
    /// Existing conversation to continue, or None to start one.
    pub conversation_id: Option<String>,
    /// The user's question.
    pub message: String,
    /// User identifier.
    pub user_id: String,
    /// Optional display nickname.
    pub user_nickname: Option<String>,
}

/// Run the full pipeline for one request, producing events into the
/// sink. Always terminates the stream cleanly: `done` after success or
/// error, nothing after client cancellation.
pub async fn run_chat(state: AppState, params: ChatParams, sink: EventSink) {
    let conversation_id = params
        .conversation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Invariant: the conversation id leads the stream.
    sink.send(ChatEvent::ConversationId {
        conversation_id: conversation_id.clone(),
    })
    .await;

    let has_error = match run_turn(&state, &params, &conversation_id, &sink).await {
        Ok(()) => false,
        Err(e) => {
            tracing::error!(error = %e, %conversation_id, "chat turn failed");
            sink.send(ChatEvent::error("internal_error", "the request failed unexpectedly"))
                .await;
            true
        }
    };

    if let Err(e) = state
        .conversations
        .end_conversation(conversation_id.clone(), has_error)
        .await
    {
        tracing::warn!(error = %e, "failed to finalize conversation");
    }

    // No `done` after cancellation; the client is gone.
    if !sink.is_closed() {
        sink.send(ChatEvent::Done).await;
    }
}

async fn run_turn(
    state: &AppState,
    params: &ChatParams,
    conversation_id: &str,
    sink: &EventSink,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let deadline = started + Duration::from_secs(state.config.agent.deadline_secs);

    state
        .conversations
        .start_conversation(
            conversation_id.to_string(),
            params.user_id.clone(),
            params.user_nickname.clone(),
            "web".to_string(),
        )
        .await?;
    state
        .conversations
        .log_message(
            conversation_id.to_string(),
            "user".to_string(),
            params.message.clone(),
            MessageExtra::default(),
            Vec::new(),
        )
        .await?;

    let profile = state.knowledge.profile(params.user_id.clone()).await?;

    // Previous assistant turn feeds pronoun resolution.
    let transcript = state
        .conversations
        .load_transcript(conversation_id.to_string())
        .await?;
    let last_turn = transcript
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.content.clone());

    // Stage 1: analysis.
    let mut step = 1u32;
    sink.send(ChatEvent::step(step, "Analyzing question", StepStatus::Running))
        .await;
    let ctx = AnalysisContext {
        user_id: params.user_id.clone(),
        last_turn,
        profile: profile.clone(),
    };
    let analysis = state.analyzer.analyze(&params.message, &ctx).await;
    sink.send(ChatEvent::step_with_detail(
        step,
        "Analyzing question",
        StepStatus::Done,
        format!(
            "{} tokens, {} tables",
            analysis
                .semantic_tokens
                .iter()
                .filter(|t| t.kind != crate::analyzer::TokenKind::Plain)
                .count(),
            analysis.candidate_tables.len()
        ),
    ))
    .await;

    // Stage 2: exemplar retrieval.
    step += 1;
    sink.send(ChatEvent::step(step, "Retrieving examples", StepStatus::Running))
        .await;
    let selection = state
        .fewshot
        .select(&params.message, &params.user_id, DEFAULT_LIMIT, true)
        .await;
    sink.send(ChatEvent::step_with_detail(
        step,
        "Retrieving examples",
        StepStatus::Done,
        format!("{} exemplars", selection.exemplars.len()),
    ))
    .await;

    // Stage 3: prompt composition and the agent loop.
    let system_prompt = state
        .composer
        .compose(&profile, &analysis, &selection.exemplars, &state.analyzer.schemas())
        .await;

    step += 1;
    sink.send(ChatEvent::step(step, "Generating answer", StepStatus::Running))
        .await;

    let messages = vec![
        Message::system(system_prompt),
        Message::user(analysis.rewritten_question.clone()),
    ];
    let tool_ctx = ToolContext {
        user_id: params.user_id.clone(),
        deadline,
        chart_hint: analysis.chart_hint,
    };
    let outcome = state
        .agent
        .run(messages, profile.group, tool_ctx, sink)
        .await;

    let final_status = if outcome.deadline_hit {
        StepStatus::Error
    } else {
        StepStatus::Done
    };
    sink.send(ChatEvent::step(step, "Generating answer", final_status))
        .await;

    // Persist the assistant turn with its debug footprint, regardless of
    // how the loop ended.
    let reasoning_steps = vec![
        serde_json::json!({"step": 1, "title": "Analyzing question", "status": "done"}),
        serde_json::json!({"step": 2, "title": "Retrieving examples", "status": "done"}),
        serde_json::json!({
            "step": 3,
            "title": "Generating answer",
            "status": if outcome.deadline_hit { "error" } else { "done" },
        }),
    ];
    let extra = MessageExtra {
        sql: outcome.sql.clone(),
        file_hash: outcome.file_hash.clone(),
        chart: outcome.chart.clone(),
        reasoning_steps,
        semantic_tokens: analysis.semantic_tokens.clone(),
        selected_tables: analysis.candidate_tables.clone(),
        knowledge_items: analysis.relevant_knowledge.clone(),
        fewshot: selection.debug.clone(),
        sql_rejected: outcome.sql_rejected,
        aborted: outcome.aborted,
        warnings: analysis.warnings.clone(),
        unknown: Default::default(),
    };
    state
        .conversations
        .log_message(
            conversation_id.to_string(),
            "assistant".to_string(),
            outcome.final_text.clone(),
            extra,
            outcome.tool_records.clone(),
        )
        .await?;

    // Successful executions feed the user's exemplar memory.
    for record in &outcome.tool_records {
        if record.success {
            if let Err(e) = state
                .memory
                .save_tool_usage(
                    params.message.clone(),
                    record.tool_name.clone(),
                    record.arguments.clone(),
                    true,
                    params.user_id.clone(),
                )
                .await
            {
                tracing::warn!(error = %e, "memory write failed");
            }
        }
    }

    // Query history drives the profile learner.
    let history = QueryHistoryEntry {
        user_id: params.user_id.clone(),
        query_text: params.message.clone(),
        rewritten_text: Some(analysis.rewritten_question.clone()),
        query_type: analysis
            .semantic_tokens
            .iter()
            .find(|t| t.kind == crate::analyzer::TokenKind::ChartHint)
            .map(|t| t.text.clone()),
        chart_type: outcome
            .chart
            .as_ref()
            .map(|c| format!("{:?}", c.chart_type).to_lowercase()),
        dimensions: token_texts(&analysis, crate::analyzer::TokenKind::Dimension),
        metrics: token_texts(&analysis, crate::analyzer::TokenKind::Metric),
        time_range: analysis
            .semantic_tokens
            .iter()
            .find(|t| t.kind == crate::analyzer::TokenKind::TimeRule)
            .map(|t| t.text.clone()),
    };
    if let Err(e) = state.knowledge.record_query(history).await {
        tracing::warn!(error = %e, "query history write failed");
    }
    if let Err(e) = state.knowledge.learn_profile(params.user_id.clone()).await {
        tracing::debug!(error = %e, "profile learning failed");
    }

    if outcome.deadline_hit {
        tracing::warn!(
            %conversation_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request hit its deadline"
        );
    }
    if outcome.aborted {
        // Client went away: mark the persisted message so the transcript
        // shows the turn never completed.
        state
            .conversations
            .update_message_extra(
                conversation_id.to_string(),
                "assistant".to_string(),
                serde_json::json!({"aborted": true}),
            )
            .await?;
    }

    Ok(())
}

fn token_texts(analysis: &crate::analyzer::Analysis, kind: crate::analyzer::TokenKind) -> Vec<String> {
    analysis
        .semantic_tokens
        .iter()
        .filter(|t| t.kind == kind)
        .map(|t| t.text.clone())
        .collect()
}
