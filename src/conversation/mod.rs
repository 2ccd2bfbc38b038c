//! Conversation log and feedback store.
//!
//! Conversations own ordered messages; assistant messages carry an
//! `extra` structure with the turn's SQL, data reference, chart, tokens,
//! and debug block. Feedback is write-through: the current row per
//! conversation is replaced and every submission is appended to history.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::analyzer::{SemanticToken, TableCandidate};
use crate::events::ChartType;
use crate::fewshot::FewShotDebug;
use crate::knowledge::KnowledgeItem;
use crate::rag::learner::UserVote;

/// A conversation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Display nickname captured at creation.
    pub user_nickname: Option<String>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Short summary (first user message, truncated).
    pub summary: Option<String>,
    /// Source tag ("web", "api").
    pub source: String,
    /// Whether any turn errored.
    pub has_error: bool,
}

/// Chart descriptor persisted on a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    /// Chart type.
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    /// X-axis column.
    pub x_key: String,
    /// Y-axis column.
    pub y_key: String,
    /// Chart title.
    pub title: String,
}

/// Side structure attached to an assistant message. Unknown fields from
/// older or newer writers are carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageExtra {
    /// SQL extracted from the turn's tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Artifact hash of the tabular result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// Chart descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    /// Ordered reasoning step titles with final status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning_steps: Vec<serde_json::Value>,
    /// Semantic tokens from the analyzer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_tokens: Vec<SemanticToken>,
    /// Selected candidate tables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_tables: Vec<TableCandidate>,
    /// Knowledge items used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge_items: Vec<KnowledgeItem>,
    /// Few-shot retrieval debug block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fewshot: Option<FewShotDebug>,
    /// Whether a submitted statement was rejected by the SQL guard.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sql_rejected: bool,
    /// Whether the stream was aborted by client disconnect.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    /// Component degradation notes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Unknown fields, stored and forwarded verbatim.
    #[serde(flatten)]
    pub unknown: HashMap<String, serde_json::Value>,
}

/// A message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Message identifier.
    pub id: i64,
    /// Owning conversation.
    pub conversation_id: String,
    /// Role: "user", "assistant", or "system".
    pub role: String,
    /// Text body.
    pub content: String,
    /// Side structure.
    pub extra: MessageExtra,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A persisted tool invocation within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Tool name.
    pub tool_name: String,
    /// Serialized arguments.
    pub arguments: serde_json::Value,
    /// Result summary for display.
    pub result_summary: String,
    /// Whether the call succeeded.
    pub success: bool,
}

/// Current feedback for a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    /// Expert rating in 1..=5.
    pub expert_rating: Option<u8>,
    /// User vote.
    pub user_vote: Option<UserVote>,
    /// LLM-judge score in 1..=5.
    pub llm_score: Option<f64>,
    /// Last update time.
    pub updated_at: Option<DateTime<Utc>>,
}

/// SQLite-backed conversation log.
pub struct ConversationLog {
    db_path: PathBuf,
    sqlite: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for ConversationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLog")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl ConversationLog {
    /// Create a log over the given database file.
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
                    "CREATE TABLE IF NOT EXISTS conversations (
                        id TEXT PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        user_nickname TEXT,
                        started_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        summary TEXT,
                        source TEXT NOT NULL DEFAULT 'web',
                        has_error INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX IF NOT EXISTS idx_conversations_user
                        ON conversations(user_id, updated_at DESC);

                    CREATE TABLE IF NOT EXISTS conversation_messages (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        conversation_id TEXT NOT NULL,
                        role TEXT NOT NULL,
                        content TEXT NOT NULL,
                        extra TEXT NOT NULL DEFAULT '{}',
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_messages_conversation
                        ON conversation_messages(conversation_id, id);

                    CREATE TABLE IF NOT EXISTS message_tool_calls (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        message_id INTEGER NOT NULL,
                        tool_name TEXT NOT NULL,
                        arguments TEXT NOT NULL,
                        result_summary TEXT NOT NULL,
                        success INTEGER NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_tool_calls_message
                        ON message_tool_calls(message_id);

                    CREATE TABLE IF NOT EXISTS feedback_current (
                        conversation_id TEXT PRIMARY KEY,
                        expert_rating INTEGER,
                        user_vote TEXT,
                        llm_score REAL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS feedback_history (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        conversation_id TEXT NOT NULL,
                        expert_rating INTEGER,
                        user_vote TEXT,
                        llm_score REAL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_feedback_history_conversation
                        ON feedback_history(conversation_id);",
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
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sqlite = self.sqlite.clone();
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut guard = sqlite.lock().unwrap();
            let conn = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("conversation log not initialized"))?;
            f(conn)
        })
        .await
        .context("spawn_blocking failed")?
    }

    /// Ensure a conversation exists; create it on first message.
    pub async fn start_conversation(
        &self,
        conversation_id: String,
        user_id: String,
        user_nickname: Option<String>,
        source: String,
    ) -> Result<()> {
        self.call(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO conversations
                 (id, user_id, user_nickname, started_at, updated_at, source, has_error)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5, 0)",
                params![conversation_id, user_id, user_nickname, now, source],
            )?;
            Ok(())
        })
        .await
    }

    /// Persist a message with its tool calls in one transaction. Returns
    /// the message ID.
    pub async fn log_message(
        &self,
        conversation_id: String,
        role: String,
        content: String,
        extra: MessageExtra,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Result<i64> {
        self.call(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversation_messages
                 (conversation_id, role, content, extra, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id,
                    role,
                    content,
                    serde_json::to_string(&extra)?,
                    now
                ],
            )?;
            let message_id = tx.last_insert_rowid();

            for record in &tool_calls {
                tx.execute(
                    "INSERT INTO message_tool_calls
                     (message_id, tool_name, arguments, result_summary, success, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        message_id,
                        record.tool_name,
                        record.arguments.to_string(),
                        record.result_summary,
                        i64::from(record.success),
                        now
                    ],
                )?;
            }

            tx.execute(
                "UPDATE conversations SET updated_at = ?2,
                     summary = COALESCE(summary, CASE WHEN ?3 = 'user' THEN ?4 END)
                 WHERE id = ?1",
                params![
                    conversation_id,
                    now,
                    role,
                    truncate_chars(&content, 80)
                ],
            )?;
            tx.commit()?;
            Ok(message_id)
        })
        .await
    }

    /// Merge additional fields into the latest message of a role.
    pub async fn update_message_extra(
        &self,
        conversation_id: String,
        role: String,
        patch: serde_json::Value,
    ) -> Result<()> {
        self.call(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, extra FROM conversation_messages
                     WHERE conversation_id = ?1 AND role = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![conversation_id, role],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((id, existing)) = row else {
                tracing::warn!(%conversation_id, "no message to update");
                return Ok(());
            };

            let mut merged: serde_json::Value =
                serde_json::from_str(&existing).unwrap_or_else(|_| serde_json::json!({}));
            if let (Some(base), Some(update)) = (merged.as_object_mut(), patch.as_object()) {
                for (key, value) in update {
                    base.insert(key.clone(), value.clone());
                }
            }
            conn.execute(
                "UPDATE conversation_messages SET extra = ?2 WHERE id = ?1",
                params![id, merged.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Mark a conversation finished, optionally flagging an error.
    pub async fn end_conversation(&self, conversation_id: String, has_error: bool) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE conversations
                 SET updated_at = ?2,
                     has_error = CASE WHEN ?3 THEN 1 ELSE has_error END
                 WHERE id = ?1",
                params![conversation_id, Utc::now().to_rfc3339(), has_error],
            )?;
            Ok(())
        })
        .await
    }

    /// List conversations, most recently updated first.
    pub async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, user_nickname, started_at, updated_at,
                        summary, source, has_error
                 FROM conversations ORDER BY updated_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_conversation)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Fetch a conversation row.
    pub async fn get_conversation(&self, conversation_id: String) -> Result<Option<Conversation>> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id, user_nickname, started_at, updated_at,
                            summary, source, has_error
                     FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    row_to_conversation,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Load the full transcript of a conversation.
    pub async fn load_transcript(&self, conversation_id: String) -> Result<Vec<StoredMessage>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, extra, created_at
                 FROM conversation_messages
                 WHERE conversation_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    extra: serde_json::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or_default(),
                    created_at: parse_time(&row.get::<_, String>(5)?),
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

    /// Tool calls persisted for a message.
    pub async fn tool_calls(&self, message_id: i64) -> Result<Vec<ToolCallRecord>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tool_name, arguments, result_summary, success
                 FROM message_tool_calls WHERE message_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![message_id], |row| {
                Ok(ToolCallRecord {
                    tool_name: row.get(0)?,
                    arguments: serde_json::from_str(&row.get::<_, String>(1)?)
                        .unwrap_or(serde_json::Value::Null),
                    result_summary: row.get(2)?,
                    success: row.get::<_, i64>(3)? != 0,
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

    /// Delete a conversation with its messages, tool calls, and feedback.
    pub async fn delete_conversation(&self, conversation_id: String) -> Result<bool> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM message_tool_calls WHERE message_id IN (
                     SELECT id FROM conversation_messages WHERE conversation_id = ?1
                 )",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM conversation_messages WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM feedback_current WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM feedback_history WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            let deleted = tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![conversation_id],
            )?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Write-through feedback: replace the current row, append to
    /// history. Fields absent from the submission keep their current
    /// value.
    pub async fn save_feedback(
        &self,
        conversation_id: String,
        expert_rating: Option<u8>,
        user_vote: Option<UserVote>,
        llm_score: Option<f64>,
    ) -> Result<Feedback> {
        self.call(move |conn| {
            let now = Utc::now().to_rfc3339();
            let current = load_feedback(conn, &conversation_id)?;

            let merged = Feedback {
                expert_rating: expert_rating.or(current.expert_rating),
                user_vote: user_vote.or(current.user_vote),
                llm_score: llm_score.or(current.llm_score),
                updated_at: Some(Utc::now()),
            };

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO feedback_current
                 (conversation_id, expert_rating, user_vote, llm_score, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                     expert_rating = excluded.expert_rating,
                     user_vote = excluded.user_vote,
                     llm_score = excluded.llm_score,
                     updated_at = excluded.updated_at",
                params![
                    conversation_id,
                    merged.expert_rating,
                    merged.user_vote.map(vote_str),
                    merged.llm_score,
                    now
                ],
            )?;
            tx.execute(
                "INSERT INTO feedback_history
                 (conversation_id, expert_rating, user_vote, llm_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_id,
                    expert_rating,
                    user_vote.map(vote_str),
                    llm_score,
                    now
                ],
            )?;
            tx.commit()?;
            Ok(merged)
        })
        .await
    }

    /// Current feedback for a conversation.
    pub async fn get_feedback(&self, conversation_id: String) -> Result<Feedback> {
        self.call(move |conn| load_feedback(conn, &conversation_id)).await
    }

    /// Extract the learner inputs for a conversation: the last user
    /// question and the last assistant message with its SQL.
    pub async fn learner_inputs(
        &self,
        conversation_id: String,
    ) -> Result<Option<(String, Option<String>, String)>> {
        let transcript = self.load_transcript(conversation_id).await?;
        let question = transcript
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone());
        let assistant = transcript.iter().rev().find(|m| m.role == "assistant");

        match (question, assistant) {
            (Some(question), Some(assistant)) => Ok(Some((
                question,
                assistant.extra.sql.clone(),
                assistant.content.clone(),
            ))),
            _ => Ok(None),
        }
    }
}

fn vote_str(vote: UserVote) -> &'static str {
    match vote {
        UserVote::Like => "like",
        UserVote::Dislike => "dislike",
        UserVote::None => "none",
    }
}

fn parse_vote(raw: &str) -> UserVote {
    match raw {
        "like" => UserVote::Like,
        "dislike" => UserVote::Dislike,
        _ => UserVote::None,
    }
}

fn load_feedback(conn: &Connection, conversation_id: &str) -> Result<Feedback> {
    let row = conn
        .query_row(
            "SELECT expert_rating, user_vote, llm_score, updated_at
             FROM feedback_current WHERE conversation_id = ?1",
            params![conversation_id],
            |row| {
                Ok(Feedback {
                    expert_rating: row.get(0)?,
                    user_vote: row.get::<_, Option<String>>(1)?.map(|v| parse_vote(&v)),
                    llm_score: row.get(2)?,
                    updated_at: Some(parse_time(&row.get::<_, String>(3)?)),
                })
            },
        )
        .optional()?;
    Ok(row.unwrap_or_default())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_nickname: row.get(2)?,
        started_at: parse_time(&row.get::<_, String>(3)?),
        updated_at: parse_time(&row.get::<_, String>(4)?),
        summary: row.get(5)?,
        source: row.get(6)?,
        has_error: row.get::<_, i64>(7)? != 0,
    })
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn log() -> (tempfile::TempDir, ConversationLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("logs.sqlite"));
        log.init().await.unwrap();
        (dir, log)
    }

    #[tokio::test]
    async fn test_message_round_trip_with_extra() {
        let (_dir, log) = log().await;
        log.start_conversation("c1".into(), "u1".into(), None, "web".into())
            .await
            .unwrap();

        let extra = MessageExtra {
            sql: Some("SELECT 1 FROM t".into()),
            file_hash: Some("abcd".into()),
            sql_rejected: false,
            ..MessageExtra::default()
        };
        let message_id = log
            .log_message(
                "c1".into(),
                "assistant".into(),
                "answer".into(),
                extra,
                vec![ToolCallRecord {
                    tool_name: "run_sql".into(),
                    arguments: serde_json::json!({"sql": "SELECT 1 FROM t"}),
                    result_summary: "1 row".into(),
                    success: true,
                }],
            )
            .await
            .unwrap();

        let transcript = log.load_transcript("c1".into()).await.unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].extra.sql.as_deref(), Some("SELECT 1 FROM t"));

        let calls = log.tool_calls(message_id).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].success);
    }

    #[tokio::test]
    async fn test_unknown_extra_fields_survive() {
        let raw = serde_json::json!({
            "sql": "SELECT 1 FROM t",
            "futureField": {"nested": true},
        });
        let extra: MessageExtra = serde_json::from_value(raw).unwrap();
        assert!(extra.unknown.contains_key("futureField"));

        let round = serde_json::to_value(&extra).unwrap();
        assert_eq!(round["futureField"]["nested"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_summary_set_from_first_user_message() {
        let (_dir, log) = log().await;
        log.start_conversation("c1".into(), "u1".into(), None, "web".into())
            .await
            .unwrap();
        log.log_message(
            "c1".into(),
            "user".into(),
            "最近7天的访问量".into(),
            MessageExtra::default(),
            Vec::new(),
        )
        .await
        .unwrap();
        log.log_message(
            "c1".into(),
            "user".into(),
            "换个问题".into(),
            MessageExtra::default(),
            Vec::new(),
        )
        .await
        .unwrap();

        let conversation = log.get_conversation("c1".into()).await.unwrap().unwrap();
        assert_eq!(conversation.summary.as_deref(), Some("最近7天的访问量"));
    }

    #[tokio::test]
    async fn test_feedback_write_through_merges_and_keeps_history() {
        let (_dir, log) = log().await;
        log.start_conversation("c1".into(), "u1".into(), None, "web".into())
            .await
            .unwrap();

        log.save_feedback("c1".into(), Some(5), None, None)
            .await
            .unwrap();
        let merged = log
            .save_feedback("c1".into(), None, Some(UserVote::Like), None)
            .await
            .unwrap();

        assert_eq!(merged.expert_rating, Some(5));
        assert_eq!(merged.user_vote, Some(UserVote::Like));

        let current = log.get_feedback("c1".into()).await.unwrap();
        assert_eq!(current.expert_rating, Some(5));
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let (_dir, log) = log().await;
        log.start_conversation("c1".into(), "u1".into(), None, "web".into())
            .await
            .unwrap();
        log.log_message(
            "c1".into(),
            "user".into(),
            "q".into(),
            MessageExtra::default(),
            Vec::new(),
        )
        .await
        .unwrap();

        assert!(log.delete_conversation("c1".into()).await.unwrap());
        assert!(log.get_conversation("c1".into()).await.unwrap().is_none());
        assert!(log.load_transcript("c1".into()).await.unwrap().is_empty());
        assert!(!log.delete_conversation("c1".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_message_extra_merges_fields() {
        let (_dir, log) = log().await;
        log.start_conversation("c1".into(), "u1".into(), None, "web".into())
            .await
            .unwrap();
        log.log_message(
            "c1".into(),
            "assistant".into(),
            "a".into(),
            MessageExtra {
                sql: Some("SELECT 1 FROM t".into()),
                ..MessageExtra::default()
            },
            Vec::new(),
        )
        .await
        .unwrap();

        log.update_message_extra(
            "c1".into(),
            "assistant".into(),
            serde_json::json!({"aborted": true}),
        )
        .await
        .unwrap();

        let transcript = log.load_transcript("c1".into()).await.unwrap();
        assert!(transcript[0].extra.aborted);
        assert_eq!(transcript[0].extra.sql.as_deref(), Some("SELECT 1 FROM t"));
    }
}
