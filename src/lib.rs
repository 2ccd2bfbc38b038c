//! ChatBI API - Conversational Analytics Service
//!
//! This crate turns plain-language questions into executed SQL and streams
//! reasoned answers back as structured events:
//!
//! - **Analyzer**: semantic tokenization, question rewriting, table selection
//! - **Retrieval**: learned Q/SQL exemplars and per-user execution memory
//! - **Agent loop**: tool-driven LLM interaction (`run_sql`, `visualize_data`)
//! - **Streaming**: ordered SSE event stream with backpressure and cancellation
//! - **Learning**: feedback ratings promote high-quality pairs into retrieval
//!
//! # Architecture
//!
//! The service is organized into several key modules:
//!
//! - [`config`]: Configuration management and environment loading
//! - [`knowledge`]: Durable store of time rules, terms, mappings, prompts
//! - [`analyzer`]: Multi-stage question analysis
//! - [`fewshot`]: Exemplar retrieval and ranking
//! - [`prompt`]: System prompt composition
//! - [`agent`]: Tool loop execution with permissions and budgets
//! - [`orchestrator`]: Event stream multiplexing
//! - [`conversation`]: Conversation log and feedback ingestion
//! - [`rag`]: Q/A corpus and the feedback learner
//! - [`api`]: HTTP API endpoints

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod analyzer;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod events;
pub mod executor;
pub mod fewshot;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod prompt;
pub mod rag;
pub mod server;
pub mod tools;

use std::sync::Arc;

use agent::AgentLoop;
use analyzer::QueryAnalyzer;
use artifacts::ArtifactStore;
use config::AppConfig;
use conversation::ConversationLog;
use fewshot::FewShotSelector;
use knowledge::KnowledgeStore;
use memory::AgentMemory;
use prompt::PromptComposer;
use rag::{RagCorpus, RagLearner};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Durable knowledge store (rules, terms, mappings, prompts, profiles).
    pub knowledge: Arc<KnowledgeStore>,
    /// Query analyzer.
    pub analyzer: Arc<QueryAnalyzer>,
    /// Few-shot exemplar selector.
    pub fewshot: Arc<FewShotSelector>,
    /// System prompt composer.
    pub composer: Arc<PromptComposer>,
    /// Agent loop runtime (driver, tools, permissions).
    pub agent: Arc<AgentLoop>,
    /// Conversation log and feedback store.
    pub conversations: Arc<ConversationLog>,
    /// RAG Q/A corpus.
    pub rag: Arc<RagCorpus>,
    /// Feedback learner feeding the corpus.
    pub learner: Arc<RagLearner>,
    /// Per-user execution memory.
    pub memory: Arc<AgentMemory>,
    /// CSV artifact store for query results.
    pub artifacts: Arc<ArtifactStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("knowledge", &"KnowledgeStore")
            .field("analyzer", &"QueryAnalyzer")
            .field("agent", &"AgentLoop")
            .finish()
    }
}
