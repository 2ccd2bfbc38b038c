//! Per-user execution memory.
//!
//! Records every tool invocation and free-text note per user. Successful
//! `run_sql` records double as exemplar candidates: the few-shot selector
//! retrieves them by recency-weighted keyword similarity.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embedding::keyword_overlap;

/// Memory bound per table; oldest rows are evicted first.
const MAX_ITEMS: i64 = 10_000;

/// A recorded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMemory {
    /// Record identifier.
    pub id: String,
    /// The question that triggered the invocation.
    pub question: String,
    /// Tool name.
    pub tool_name: String,
    /// Serialized arguments.
    pub args: serde_json::Value,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Owning user.
    pub user_id: String,
    /// When the invocation happened.
    pub created_at: DateTime<Utc>,
}

/// A free-text memory note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMemory {
    /// Record identifier.
    pub id: String,
    /// Note content.
    pub content: String,
    /// Owning user.
    pub user_id: String,
    /// When the note was stored.
    pub created_at: DateTime<Utc>,
}

/// A retrieval hit from execution memory.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    /// The recorded question.
    pub question: String,
    /// The SQL that was executed.
    pub sql: String,
    /// Recency-weighted similarity to the query.
    pub similarity: f32,
}

/// Memory statistics for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Stored tool records.
    pub tool_count: i64,
    /// Stored text notes.
    pub text_count: i64,
    /// Successful tool records.
    pub success_count: i64,
}

/// SQLite-backed agent memory.
pub struct AgentMemory {
    db_path: PathBuf,
    sqlite: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for AgentMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMemory")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl AgentMemory {
    /// Create a memory store over the given database file.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            sqlite: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the database and apply the schema.
    pub async fn init(&self) -> Result<()> {
        let sqlite = self.sqlite.clone();
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = sqlite.lock().unwrap();
            if guard.is_none() {
                if let Some(parent) = db_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(&db_path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS tool_memory (
                        id TEXT PRIMARY KEY,
                        question TEXT NOT NULL,
                        tool_name TEXT NOT NULL,
                        args TEXT NOT NULL,
                        success INTEGER NOT NULL DEFAULT 1,
                        user_id TEXT NOT NULL DEFAULT 'system',
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_tool_memory_user
                        ON tool_memory(user_id, success);
                    CREATE INDEX IF NOT EXISTS idx_tool_memory_created
                        ON tool_memory(created_at);

                    CREATE TABLE IF NOT EXISTS text_memory (
                        id TEXT PRIMARY KEY,
                        content TEXT NOT NULL,
                        user_id TEXT NOT NULL DEFAULT 'system',
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_text_memory_user
                        ON text_memory(user_id);",
                )?;
                *guard = Some(conn);
            }
            Ok(())
        })
        .await
        .context("spawn_blocking failed")?
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sqlite = self.sqlite.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let guard = sqlite.lock().unwrap();
            let conn = guard
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("agent memory not initialized"))?;
            f(conn)
        })
        .await
        .context("spawn_blocking failed")?
    }

    /// Record a tool invocation.
    pub async fn save_tool_usage(
        &self,
        question: String,
        tool_name: String,
        args: serde_json::Value,
        success: bool,
        user_id: String,
    ) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO tool_memory (id, question, tool_name, args, success, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    question,
                    tool_name,
                    args.to_string(),
                    i64::from(success),
                    user_id,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            enforce_limit(conn, "tool_memory")?;
            Ok(())
        })
        .await
    }

    /// Record a free-text note.
    pub async fn save_text(&self, content: String, user_id: String) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO text_memory (id, content, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    content,
                    user_id,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            enforce_limit(conn, "text_memory")?;
            Ok(())
        })
        .await
    }

    /// Successful past `run_sql` invocations for a user, ranked by
    /// recency-weighted keyword similarity to the question.
    pub async fn search_similar_sql(
        &self,
        user_id: String,
        question: String,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT question, args, created_at FROM tool_memory
                 WHERE success = 1 AND tool_name = 'run_sql'
                   AND (user_id = ?1 OR user_id = 'system')
                 ORDER BY created_at DESC LIMIT 500",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let now = Utc::now();
            let mut hits: Vec<MemoryHit> = Vec::new();
            for row in rows {
                let (stored_question, args, created_at) = row?;
                let sql = serde_json::from_str::<serde_json::Value>(&args)
                    .ok()
                    .and_then(|v| v["sql"].as_str().map(String::from));
                let Some(sql) = sql else { continue };

                let base = keyword_overlap(&question, &stored_question);
                if base <= 0.0 {
                    continue;
                }
                let age_days = DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| (now - t.with_timezone(&Utc)).num_days().max(0))
                    .unwrap_or(0) as f32;
                let recency = 1.0 / (1.0 + age_days / 7.0);
                hits.push(MemoryHit {
                    question: stored_question,
                    sql,
                    similarity: base * recency,
                });
            }

            hits.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }

    /// Most recent tool records.
    pub async fn recent_tools(&self, limit: usize) -> Result<Vec<ToolMemory>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, question, tool_name, args, success, user_id, created_at
                 FROM tool_memory ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(ToolMemory {
                    id: row.get(0)?,
                    question: row.get(1)?,
                    tool_name: row.get(2)?,
                    args: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(serde_json::Value::Null),
                    success: row.get::<_, i64>(4)? != 0,
                    user_id: row.get(5)?,
                    created_at: parse_time(&row.get::<_, String>(6)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Most recent text notes.
    pub async fn recent_texts(&self, limit: usize) -> Result<Vec<TextMemory>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content, user_id, created_at
                 FROM text_memory ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(TextMemory {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    user_id: row.get(2)?,
                    created_at: parse_time(&row.get::<_, String>(3)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Memory statistics.
    pub async fn stats(&self) -> Result<MemoryStats> {
        self.call(|conn| {
            let tool_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM tool_memory", [], |r| r.get(0))?;
            let success_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tool_memory WHERE success = 1",
                [],
                |r| r.get(0),
            )?;
            let text_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM text_memory", [], |r| r.get(0))?;
            Ok(MemoryStats {
                tool_count,
                text_count,
                success_count,
            })
        })
        .await
    }
}

fn enforce_limit(conn: &Connection, table: &str) -> Result<()> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
        r.get(0)
    })?;
    if count > MAX_ITEMS {
        conn.execute(
            &format!(
                "DELETE FROM {table} WHERE id IN (
                     SELECT id FROM {table} ORDER BY created_at ASC LIMIT ?1
                 )"
            ),
            params![count - MAX_ITEMS],
        )?;
    }
    Ok(())
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory() -> (tempfile::TempDir, AgentMemory) {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::new(dir.path().join("memory.sqlite"));
        memory.init().await.unwrap();
        (dir, memory)
    }

    #[tokio::test]
    async fn test_search_returns_only_successful_run_sql() {
        let (_dir, memory) = memory().await;
        memory
            .save_tool_usage(
                "最近7天的访问量".into(),
                "run_sql".into(),
                serde_json::json!({"sql": "SELECT 1 FROM gio_event"}),
                true,
                "u1".into(),
            )
            .await
            .unwrap();
        memory
            .save_tool_usage(
                "最近7天的访问量".into(),
                "run_sql".into(),
                serde_json::json!({"sql": "SELECT broken"}),
                false,
                "u1".into(),
            )
            .await
            .unwrap();
        memory
            .save_tool_usage(
                "最近7天的访问量".into(),
                "visualize_data".into(),
                serde_json::json!({"file_hash": "abc"}),
                true,
                "u1".into(),
            )
            .await
            .unwrap();

        let hits = memory
            .search_similar_sql("u1".into(), "最近7天的访问量".into(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].sql, "SELECT 1 FROM gio_event");
    }

    #[tokio::test]
    async fn test_search_is_user_scoped() {
        let (_dir, memory) = memory().await;
        memory
            .save_tool_usage(
                "销售额排名".into(),
                "run_sql".into(),
                serde_json::json!({"sql": "SELECT * FROM sales"}),
                true,
                "other-user".into(),
            )
            .await
            .unwrap();

        let hits = memory
            .search_similar_sql("u1".into(), "销售额排名".into(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let (_dir, memory) = memory().await;
        memory
            .save_tool_usage(
                "q".into(),
                "run_sql".into(),
                serde_json::json!({"sql": "SELECT 1 FROM t"}),
                true,
                "u1".into(),
            )
            .await
            .unwrap();
        memory.save_text("note".into(), "u1".into()).await.unwrap();

        let stats = memory.stats().await.unwrap();
        assert_eq!(stats.tool_count, 1);
        assert_eq!(stats.text_count, 1);
        assert_eq!(stats.success_count, 1);
    }
}
