//! Tool execution infrastructure.
//!
//! The agent loop dispatches LLM tool calls through a registry of typed
//! tools. Each tool returns both a string observation for the LLM and,
//! when applicable, structured events for the client stream.

mod run_sql;
mod visualize;

pub use run_sql::{guard_sql, RunSqlTool};
pub use visualize::VisualizeDataTool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::ChatEvent;

/// A tool definition for LLM function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// JSON schema for tool parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Convert to OpenAI function schema format.
    pub fn to_openai_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters
            }
        })
    }
}

/// Per-request context passed to tool executions.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// User on whose behalf the tool runs.
    pub user_id: String,
    /// Hard deadline for the surrounding request.
    pub deadline: Instant,
    /// Chart hint detected by the analyzer, if any.
    pub chart_hint: Option<crate::events::ChartType>,
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Observation string fed back to the LLM.
    pub content: String,
    /// Structured events for the client stream, in emission order.
    pub events: Vec<ChatEvent>,
    /// SQL the tool executed, when applicable.
    pub sql: Option<String>,
    /// Artifact hash the tool produced, when applicable.
    pub file_hash: Option<String>,
}

impl ToolOutput {
    /// A plain observation without structured events.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            events: Vec::new(),
            sql: None,
            file_hash: None,
        }
    }
}

/// Trait for executable tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON-encoded arguments.
    async fn execute(&self, arguments: &str, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools = self.tools.read();
        f.debug_struct("ToolRegistry")
            .field("tools", &tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write();
        let name = tool.definition().name.clone();
        tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read();
        tools.get(name).cloned()
    }

    /// Get tool schemas in OpenAI format.
    pub fn get_tool_schemas(&self) -> Vec<serde_json::Value> {
        let tools = self.tools.read();
        tools
            .values()
            .map(|t| t.definition().to_openai_schema())
            .collect()
    }

    /// List all registered tool names.
    pub fn list_tools(&self) -> Vec<String> {
        let tools = self.tools.read();
        tools.keys().cloned().collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &str,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Tool not found: {}", name))?;
        tool.execute(arguments, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "Echo the input", serde_json::json!({}))
        }

        async fn execute(&self, arguments: &str, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::text(arguments.to_string()))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            user_id: "u1".into(),
            deadline: Instant::now() + std::time::Duration::from_secs(60),
            chart_hint: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let output = registry.execute("echo", "{\"x\":1}", &ctx()).await.unwrap();
        assert_eq!(output.content, "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        assert!(registry.execute("nope", "{}", &ctx()).await.is_err());
    }

    #[test]
    fn test_openai_schema_shape() {
        let def = ToolDefinition::new("run_sql", "Run SQL", serde_json::json!({"type": "object"}));
        let schema = def.to_openai_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "run_sql");
    }
}
