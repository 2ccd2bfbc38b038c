//! The `run_sql` tool.
//!
//! Validates the statement, executes it against the query executor, writes
//! the full rows to a CSV artifact, and reports a compact descriptor back
//! to both the LLM and the client stream.

use std::sync::Arc;

use async_trait::async_trait;

use crate::artifacts::ArtifactStore;
use crate::events::ChatEvent;
use crate::executor::QueryExecutor;
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolOutput};

/// Rows included in the inline preview.
const PREVIEW_ROWS: usize = 10;

/// Keywords that must not appear anywhere in a submitted statement.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "PRAGMA", "ATTACH",
];

/// Validate a SQL statement before dispatch.
///
/// The statement must begin with SELECT, contain FROM, and contain none of
/// the forbidden keywords. Violations are recoverable: the caller reports
/// them to the LLM as tool errors rather than failing the request.
pub fn guard_sql(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err("empty SQL statement".to_string());
    }

    let upper = trimmed.to_uppercase();
    if !upper.starts_with("SELECT") {
        return Err("only SELECT statements are allowed".to_string());
    }
    if !upper.contains("FROM") {
        return Err("statement must contain a FROM clause".to_string());
    }

    for keyword in FORBIDDEN_KEYWORDS {
        // Word-boundary check so column names like `updated_at` pass.
        let mut search_from = 0;
        while let Some(pos) = upper[search_from..].find(keyword) {
            let start = search_from + pos;
            let end = start + keyword.len();
            let before_ok = start == 0
                || !upper.as_bytes()[start - 1].is_ascii_alphanumeric()
                    && upper.as_bytes()[start - 1] != b'_';
            let after_ok = end >= upper.len()
                || !upper.as_bytes()[end].is_ascii_alphanumeric()
                    && upper.as_bytes()[end] != b'_';
            if before_ok && after_ok {
                return Err(format!("forbidden keyword: {}", keyword));
            }
            search_from = end;
        }
    }

    Ok(())
}

/// Extract a SELECT statement from free-form assistant text, stripping
/// code fences and trailing semicolons.
pub fn extract_sql(text: &str) -> Option<String> {
    let stripped = text
        .replace("```sql", "\n")
        .replace("```SQL", "\n")
        .replace("```", "\n");

    let upper = stripped.to_uppercase();
    let start = upper.find("SELECT")?;
    let rest = &stripped[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    let candidate = rest[..end].trim();
    if candidate.is_empty() {
        return None;
    }
    Some(candidate.to_string())
}

/// Executes validated SQL and materializes the result as an artifact.
pub struct RunSqlTool {
    executor: Arc<dyn QueryExecutor>,
    artifacts: Arc<ArtifactStore>,
}

impl RunSqlTool {
    /// Create the tool.
    pub fn new(executor: Arc<dyn QueryExecutor>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            executor,
            artifacts,
        }
    }
}

#[async_trait]
impl Tool for RunSqlTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "run_sql",
            "Execute a read-only SQL SELECT statement against the analytics \
             database and return a result descriptor. The full rows are \
             stored as a CSV artifact addressed by fileHash.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "The SELECT statement to execute"
                    }
                },
                "required": ["sql"]
            }),
        )
    }

    async fn execute(&self, arguments: &str, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let args: serde_json::Value = serde_json::from_str(arguments)
            .map_err(|e| anyhow::anyhow!("invalid run_sql arguments: {}", e))?;
        let sql = args["sql"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing sql argument"))?
            .trim()
            .trim_end_matches(';')
            .to_string();

        if let Err(reason) = guard_sql(&sql) {
            // Recoverable: the LLM gets the reason and may retry.
            anyhow::bail!("SQL rejected: {}", reason);
        }

        let output = self.executor.run_query(&sql).await?;
        let row_count = output.rows.len();
        let file_hash = self.artifacts.store(&output)?;

        let preview: Vec<Vec<serde_json::Value>> =
            output.rows.iter().take(PREVIEW_ROWS).cloned().collect();

        let observation = serde_json::json!({
            "rowCount": row_count,
            "columns": output.columns.clone(),
            "fileHash": file_hash.clone(),
            "preview": preview.clone(),
        })
        .to_string();

        Ok(ToolOutput {
            content: observation,
            events: vec![ChatEvent::Dataframe {
                file_hash: file_hash.clone(),
                row_count,
                columns: output.columns,
                preview,
            }],
            sql: Some(sql),
            file_hash: Some(file_hash),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_accepts_plain_select() {
        assert!(guard_sql("SELECT date, COUNT(*) FROM gio_event GROUP BY date").is_ok());
        assert!(guard_sql("  select * from sales  ").is_ok());
    }

    #[test]
    fn test_guard_rejects_ddl_and_dml() {
        assert!(guard_sql("DROP TABLE sales").is_err());
        assert!(guard_sql("SELECT * FROM t; DELETE FROM t").is_err());
        assert!(guard_sql("UPDATE t SET x = 1").is_err());
        assert!(guard_sql("SELECT * FROM t WHERE id IN (SELECT 1); PRAGMA table_info(t)").is_err());
    }

    #[test]
    fn test_guard_requires_select_and_from() {
        assert!(guard_sql("WITH x AS (SELECT 1) SELECT * FROM x").is_err());
        assert!(guard_sql("SELECT 1").is_err());
        assert!(guard_sql("").is_err());
    }

    #[test]
    fn test_guard_allows_keyword_substrings_in_identifiers() {
        assert!(guard_sql("SELECT updated_at FROM orders").is_ok());
        assert!(guard_sql("SELECT dropped_items FROM inventory").is_ok());
    }

    #[test]
    fn test_extract_sql_from_fenced_block() {
        let text = "Here is the query:\n```sql\nSELECT a FROM t;\n```\nDone.";
        assert_eq!(extract_sql(text).unwrap(), "SELECT a FROM t");
    }

    #[test]
    fn test_extract_sql_absent() {
        assert!(extract_sql("no queries here").is_none());
    }
}
