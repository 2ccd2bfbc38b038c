//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::agent::{AgentLoop, ToolPermissionManager};
use crate::analyzer::QueryAnalyzer;
use crate::api;
use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::conversation::ConversationLog;
use crate::embedding::HttpEmbedder;
use crate::executor::SqliteExecutor;
use crate::fewshot::FewShotSelector;
use crate::knowledge::KnowledgeStore;
use crate::llm::providers::create_driver;
use crate::llm::LlmSettings;
use crate::logging::OpTimer;
use crate::memory::AgentMemory;
use crate::prompt::PromptComposer;
use crate::rag::{RagCorpus, RagLearner};
use crate::tools::{RunSqlTool, ToolRegistry, VisualizeDataTool};
use crate::{log_init_step, log_init_warning, log_success, AppState};

/// Interval between corpus eviction sweeps.
const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Create the application with all routes and middleware.
pub async fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    let overall_timer = OpTimer::new("server", "create_app");

    let store_path = config.storage.data_dir.join("chatbi.sqlite");
    let data_path = config.storage.data_dir.join("data.sqlite");

    // [1/8] LLM driver
    let step_timer = OpTimer::new("server", "llm_driver");
    let llm_settings = LlmSettings::from(&config.llm);
    if llm_settings.api_key.is_none() {
        log_init_warning!("No LLM API key configured; model calls will fail");
    }
    let driver = create_driver(llm_settings.clone());
    log_init_step!(1, 8, "LLM Driver", format!("{} @ {}", llm_settings.model, llm_settings.base_url));
    step_timer.finish();

    // [2/8] Embedder
    let step_timer = OpTimer::new("server", "embedder");
    let embedder = Arc::new(HttpEmbedder::new(config.embedding.clone()));
    log_init_step!(2, 8, "Embedder", config.embedding.model.clone());
    step_timer.finish();

    // [3/8] Knowledge store
    let step_timer = OpTimer::new("server", "knowledge");
    let knowledge = Arc::new(KnowledgeStore::new(store_path.clone()));
    knowledge.init().await?;
    let snapshot = knowledge.snapshot();
    log_init_step!(
        3,
        8,
        "Knowledge Store",
        format!(
            "{} rules, {} terms, {} mappings",
            snapshot.time_rules.len(),
            snapshot.terms.len(),
            snapshot.field_mappings.len()
        )
    );
    step_timer.finish();

    // [4/8] Query executor and artifact store
    let step_timer = OpTimer::new("server", "executor");
    let executor = Arc::new(SqliteExecutor::new(data_path.clone()));
    executor.init().await?;
    let artifacts = Arc::new(ArtifactStore::new(config.storage.artifact_dir.clone()));
    artifacts.init()?;
    log_init_step!(4, 8, "Query Executor", data_path.display().to_string());
    step_timer.finish();

    // [5/8] Corpus, memory, conversation log
    let step_timer = OpTimer::new("server", "stores");
    let rag = Arc::new(RagCorpus::new(store_path.clone()));
    rag.init().await?;
    let memory = Arc::new(AgentMemory::new(store_path.clone()));
    memory.init().await?;
    let conversations = Arc::new(ConversationLog::new(store_path.clone()));
    conversations.init().await?;
    let corpus_stats = rag.stats().await?;
    log_init_step!(5, 8, "Durable Stores", format!("{} corpus entries", corpus_stats.total));
    step_timer.finish();

    // [6/8] Analyzer
    let step_timer = OpTimer::new("server", "analyzer");
    let analyzer = Arc::new(QueryAnalyzer::new(knowledge.clone(), driver.clone()));
    if let Err(e) = analyzer.refresh_schema(executor.as_ref()).await {
        log_init_warning!("Schema load failed: {}; table selection degraded", e);
    }
    log_init_step!(6, 8, "Query Analyzer", format!("{} tables", analyzer.schemas().len()));
    step_timer.finish();

    // [7/8] Retrieval, composer, learner, agent loop
    let step_timer = OpTimer::new("server", "agent");
    let fewshot = Arc::new(FewShotSelector::new(
        rag.clone(),
        memory.clone(),
        embedder.clone(),
    ));
    let composer = Arc::new(PromptComposer::new(knowledge.clone()));
    let learner = Arc::new(RagLearner::new(rag.clone(), embedder.clone()));

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(RunSqlTool::new(executor.clone(), artifacts.clone())));
    tools.register(Arc::new(VisualizeDataTool::new(artifacts.clone())));
    let permissions = Arc::new(ToolPermissionManager::new());
    let agent = Arc::new(AgentLoop::new(
        driver,
        tools,
        permissions,
        config.agent.max_iterations,
    ));
    log_init_step!(7, 8, "Agent Loop", format!("{} tools", agent.tools().list_tools().len()));
    step_timer.finish();

    let state = AppState {
        config: Arc::new(config.clone()),
        knowledge,
        analyzer,
        fewshot,
        composer,
        agent,
        conversations,
        rag: rag.clone(),
        learner,
        memory,
        artifacts,
    };

    // Background sweep for low-value corpus entries.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match rag.evict_stale().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "corpus eviction sweep"),
                Err(e) => tracing::warn!(error = %e, "corpus eviction sweep failed"),
            }
        }
    });

    // [8/8] Router with middleware
    let step_timer = OpTimer::new("server", "router");
    let app = api::create_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.server.timeout_secs),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    log_init_step!(8, 8, "Router", "routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("ChatBI API server created successfully");

    Ok(app)
}
