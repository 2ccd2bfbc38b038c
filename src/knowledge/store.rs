//! SQLite-backed knowledge store.
//!
//! Single writer per entity, WAL mode, blocking work on the tokio
//! blocking pool. Dictionary writes rebuild the in-process snapshot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    BusinessTerm, ExpertiseLevel, FieldMapping, KnowledgeSnapshot, PromptVersion,
    QueryHistoryEntry, TermKind, TimeRule, UserGroup, UserProfile,
};

/// Built-in default for the main system prompt, used when no version is
/// active and seeded as `system_prompt` v1.0 on first boot.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a data analysis assistant. You translate natural-language \
questions into SQL, execute them with the run_sql tool, and visualize \
aggregated results with the visualize_data tool.

## Available tables
{schema_summary}

## Business glossary
{glossary}

## Worked examples
{exemplars}

{personalization}

Conventions:
- For trend questions (趋势/变化/走势) prefer line charts.
- For ranking or comparison questions (排名/对比/Top N) prefer bar charts.
- For share-of-whole questions (占比/分布/构成) prefer pie charts.
- Summarize totals, extremes, and notable changes in the final answer.";

/// Default prompt for the question rewriting stage.
pub const DEFAULT_REWRITE_PROMPT: &str = "\
Rewrite the user's question so it is self-contained and explicit. Resolve \
pronouns using the previous turn, expand field aliases to their canonical \
names, and make time expressions concrete.

## Previous turn
{context}

## Known aliases
{aliases}

## Question
{question}

Reply with the rewritten question only.";

/// Default prompt for LLM-based table selection.
pub const DEFAULT_TABLE_SELECT_PROMPT: &str = "\
You are a database expert. Given the schema below, select the tables most \
relevant to the user's question.

## Schema
{schema_description}

## Question
{question}

Reply with JSON only: {\"tables\": [\"name\"], \"reason\": \"why\"}. \
Use an empty list when no table fits.";

/// Durable store of rules, terms, mappings, prompts, and profiles.
pub struct KnowledgeStore {
    db_path: PathBuf,
    sqlite: Arc<Mutex<Option<Connection>>>,
    snapshot: ArcSwap<KnowledgeSnapshot>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = self.sqlite.lock().map(|g| g.is_some()).unwrap_or(false);
        f.debug_struct("KnowledgeStore")
            .field("db_path", &self.db_path)
            .field("ready", &ready)
            .finish()
    }
}

impl KnowledgeStore {
    /// Create a store rooted at the given database file.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            sqlite: Arc::new(Mutex::new(None)),
            snapshot: ArcSwap::from_pointee(KnowledgeSnapshot::default()),
        }
    }

    /// Open the database, apply the schema, seed defaults, and build the
    /// initial snapshot.
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
                    "CREATE TABLE IF NOT EXISTS time_rules (
                        keyword TEXT PRIMARY KEY,
                        rule_type TEXT NOT NULL,
                        config TEXT NOT NULL,
                        description TEXT,
                        priority INTEGER NOT NULL DEFAULT 0,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS business_terms (
                        term TEXT PRIMARY KEY,
                        kind TEXT NOT NULL,
                        definition TEXT NOT NULL,
                        sql_expression TEXT,
                        priority INTEGER NOT NULL DEFAULT 0,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS field_mappings (
                        display_name TEXT PRIMARY KEY,
                        table_name TEXT NOT NULL,
                        field_name TEXT NOT NULL,
                        field_value TEXT NOT NULL,
                        priority INTEGER NOT NULL DEFAULT 0,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS prompt_versions (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        name TEXT NOT NULL,
                        version TEXT NOT NULL,
                        content TEXT NOT NULL,
                        description TEXT,
                        is_active INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        UNIQUE(name, version)
                    );
                    CREATE INDEX IF NOT EXISTS idx_prompt_active
                        ON prompt_versions(name, is_active);

                    CREATE TABLE IF NOT EXISTS user_profiles (
                        user_id TEXT PRIMARY KEY,
                        nickname TEXT,
                        expertise_level TEXT NOT NULL DEFAULT 'intermediate',
                        preferred_chart TEXT,
                        preferred_time_range TEXT,
                        focus_dimensions TEXT,
                        user_group TEXT NOT NULL DEFAULT 'user',
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS user_query_history (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        user_id TEXT NOT NULL,
                        query_text TEXT NOT NULL,
                        rewritten_text TEXT,
                        query_type TEXT,
                        chart_type TEXT,
                        dimensions TEXT,
                        metrics TEXT,
                        time_range TEXT,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_query_history_user
                        ON user_query_history(user_id, id DESC);",
                )?;

                Self::seed_default_prompts(&conn)?;
                *guard = Some(conn);
            }
            Ok(())
        })
        .await
        .context("spawn_blocking failed")??;

        self.reload_snapshot().await?;
        Ok(())
    }

    fn seed_default_prompts(conn: &Connection) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let defaults = [
            ("system_prompt", DEFAULT_SYSTEM_PROMPT, "Base system prompt"),
            ("rewrite_prompt", DEFAULT_REWRITE_PROMPT, "Question rewriting"),
            (
                "table_select_prompt",
                DEFAULT_TABLE_SELECT_PROMPT,
                "LLM table selection fallback",
            ),
        ];
        for (name, content, description) in defaults {
            conn.execute(
                "INSERT OR IGNORE INTO prompt_versions
                 (name, version, content, description, is_active, created_at, updated_at)
                 VALUES (?1, 'v1.0', ?2, ?3, 0, ?4, ?4)",
                params![name, content, description, now],
            )?;
            // Activate v1.0 only when nothing is active for this name yet.
            let active: i64 = conn.query_row(
                "SELECT COUNT(*) FROM prompt_versions WHERE name = ?1 AND is_active = 1",
                params![name],
                |row| row.get(0),
            )?;
            if active == 0 {
                conn.execute(
                    "UPDATE prompt_versions SET is_active = 1
                     WHERE name = ?1 AND version = 'v1.0'",
                    params![name],
                )?;
            }
        }
        Ok(())
    }

    /// Run a closure against the open connection on the blocking pool.
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
                .ok_or_else(|| anyhow::anyhow!("knowledge store not initialized"))?;
            f(conn)
        })
        .await
        .context("spawn_blocking failed")?
    }

    /// Current dictionary snapshot for lock-free reads.
    pub fn snapshot(&self) -> Arc<KnowledgeSnapshot> {
        self.snapshot.load_full()
    }

    /// Rebuild the snapshot from the database and swap it in atomically.
    pub async fn reload_snapshot(&self) -> Result<()> {
        let (rules, terms, mappings) = self
            .call(|conn| {
                let rules = load_time_rules(conn)?;
                let terms = load_terms(conn)?;
                let mappings = load_mappings(conn)?;
                Ok((rules, terms, mappings))
            })
            .await?;

        self.snapshot
            .store(Arc::new(KnowledgeSnapshot::new(rules, terms, mappings)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Time rules
    // ------------------------------------------------------------------

    /// List all time rules.
    pub async fn list_time_rules(&self) -> Result<Vec<TimeRule>> {
        self.call(load_time_rules).await
    }

    /// Insert or replace a time rule by keyword, then reload the snapshot.
    pub async fn upsert_time_rule(&self, rule: TimeRule) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO time_rules (keyword, rule_type, config, description, priority, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(keyword) DO UPDATE SET
                     rule_type = excluded.rule_type,
                     config = excluded.config,
                     description = excluded.description,
                     priority = excluded.priority,
                     updated_at = excluded.updated_at",
                params![
                    rule.keyword,
                    rule.rule_type,
                    rule.config.to_string(),
                    rule.description,
                    rule.priority,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.reload_snapshot().await
    }

    /// Delete a time rule. Returns whether a row existed.
    pub async fn delete_time_rule(&self, keyword: String) -> Result<bool> {
        let deleted = self
            .call(move |conn| {
                let n = conn.execute("DELETE FROM time_rules WHERE keyword = ?1", params![keyword])?;
                Ok(n > 0)
            })
            .await?;
        if deleted {
            self.reload_snapshot().await?;
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Business terms
    // ------------------------------------------------------------------

    /// List all business terms.
    pub async fn list_terms(&self) -> Result<Vec<BusinessTerm>> {
        self.call(load_terms).await
    }

    /// Insert or replace a business term, then reload the snapshot.
    pub async fn upsert_term(&self, term: BusinessTerm) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO business_terms (term, kind, definition, sql_expression, priority, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(term) DO UPDATE SET
                     kind = excluded.kind,
                     definition = excluded.definition,
                     sql_expression = excluded.sql_expression,
                     priority = excluded.priority,
                     updated_at = excluded.updated_at",
                params![
                    term.term,
                    term.kind.as_str(),
                    term.definition,
                    term.sql_expression,
                    term.priority,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.reload_snapshot().await
    }

    /// Delete a business term. Returns whether a row existed.
    pub async fn delete_term(&self, term: String) -> Result<bool> {
        let deleted = self
            .call(move |conn| {
                let n = conn.execute("DELETE FROM business_terms WHERE term = ?1", params![term])?;
                Ok(n > 0)
            })
            .await?;
        if deleted {
            self.reload_snapshot().await?;
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Field mappings
    // ------------------------------------------------------------------

    /// List all field mappings.
    pub async fn list_mappings(&self) -> Result<Vec<FieldMapping>> {
        self.call(load_mappings).await
    }

    /// Insert or replace a field mapping, then reload the snapshot.
    pub async fn upsert_mapping(&self, mapping: FieldMapping) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO field_mappings
                 (display_name, table_name, field_name, field_value, priority, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(display_name) DO UPDATE SET
                     table_name = excluded.table_name,
                     field_name = excluded.field_name,
                     field_value = excluded.field_value,
                     priority = excluded.priority,
                     updated_at = excluded.updated_at",
                params![
                    mapping.display_name,
                    mapping.table_name,
                    mapping.field_name,
                    mapping.field_value,
                    mapping.priority,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.reload_snapshot().await
    }

    /// Delete a field mapping. Returns whether a row existed.
    pub async fn delete_mapping(&self, display_name: String) -> Result<bool> {
        let deleted = self
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM field_mappings WHERE display_name = ?1",
                    params![display_name],
                )?;
                Ok(n > 0)
            })
            .await?;
        if deleted {
            self.reload_snapshot().await?;
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Prompt versions
    // ------------------------------------------------------------------

    /// Create a new prompt version. Fails on duplicate `(name, version)`.
    pub async fn create_prompt(
        &self,
        name: String,
        version: String,
        content: String,
        description: Option<String>,
    ) -> Result<i64> {
        self.call(move |conn| {
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO prompt_versions
                 (name, version, content, description, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                params![name, version, content, description, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// List prompt versions, optionally filtered by name.
    pub async fn list_prompts(&self, name: Option<String>) -> Result<Vec<PromptVersion>> {
        self.call(move |conn| {
            let mut rows = Vec::new();
            let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<PromptVersion> {
                Ok(PromptVersion {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    version: row.get(2)?,
                    content: row.get(3)?,
                    description: row.get(4)?,
                    is_active: row.get::<_, i64>(5)? != 0,
                })
            };
            match name {
                Some(name) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, name, version, content, description, is_active
                         FROM prompt_versions WHERE name = ?1
                         ORDER BY is_active DESC, created_at DESC",
                    )?;
                    let iter = stmt.query_map(params![name], map)?;
                    for row in iter {
                        rows.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, name, version, content, description, is_active
                         FROM prompt_versions
                         ORDER BY name, is_active DESC, created_at DESC",
                    )?;
                    let iter = stmt.query_map([], map)?;
                    for row in iter {
                        rows.push(row?);
                    }
                }
            }
            Ok(rows)
        })
        .await
    }

    /// Get the active version for a prompt name.
    pub async fn active_prompt(&self, name: String) -> Result<Option<PromptVersion>> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, version, content, description, is_active
                     FROM prompt_versions WHERE name = ?1 AND is_active = 1",
                    params![name],
                    |row| {
                        Ok(PromptVersion {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            version: row.get(2)?,
                            content: row.get(3)?,
                            description: row.get(4)?,
                            is_active: row.get::<_, i64>(5)? != 0,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Content of the active version, or the fallback when none is active.
    pub async fn active_prompt_content(&self, name: &str, fallback: &str) -> String {
        match self.active_prompt(name.to_string()).await {
            Ok(Some(prompt)) => prompt.content,
            Ok(None) => fallback.to_string(),
            Err(e) => {
                tracing::warn!(name, error = %e, "prompt lookup failed, using fallback");
                fallback.to_string()
            }
        }
    }

    /// Activate a version. Deactivating siblings and activating the target
    /// happen in one transaction, so exactly one version is active per name
    /// at any instant. Returns false when the version does not exist.
    pub async fn activate_prompt(&self, name: String, version: String) -> Result<bool> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM prompt_versions WHERE name = ?1 AND version = ?2",
                params![name, version],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE prompt_versions SET is_active = 0 WHERE name = ?1",
                params![name],
            )?;
            tx.execute(
                "UPDATE prompt_versions SET is_active = 1, updated_at = ?3
                 WHERE name = ?1 AND version = ?2",
                params![name, version, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Delete a prompt version. Active versions cannot be deleted.
    pub async fn delete_prompt(&self, name: String, version: String) -> Result<bool> {
        self.call(move |conn| {
            let is_active: Option<i64> = conn
                .query_row(
                    "SELECT is_active FROM prompt_versions WHERE name = ?1 AND version = ?2",
                    params![name, version],
                    |row| row.get(0),
                )
                .optional()?;
            match is_active {
                None => Ok(false),
                Some(1) => anyhow::bail!("cannot delete the active prompt version"),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM prompt_versions WHERE name = ?1 AND version = ?2",
                        params![name, version],
                    )?;
                    Ok(true)
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // User profiles and query history
    // ------------------------------------------------------------------

    /// Fetch a user profile, defaulting to a guest profile.
    pub async fn profile(&self, user_id: String) -> Result<UserProfile> {
        let lookup_id = user_id.clone();
        let profile = self
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT user_id, nickname, expertise_level, preferred_chart,
                                preferred_time_range, focus_dimensions, user_group
                         FROM user_profiles WHERE user_id = ?1",
                        params![lookup_id],
                        |row| {
                            let dims: Option<String> = row.get(5)?;
                            let group: String = row.get(6)?;
                            Ok(UserProfile {
                                user_id: row.get(0)?,
                                nickname: row.get(1)?,
                                expertise_level: ExpertiseLevel::parse(
                                    &row.get::<_, String>(2)?,
                                ),
                                preferred_chart: row.get(3)?,
                                preferred_time_range: row.get(4)?,
                                focus_dimensions: dims
                                    .and_then(|d| serde_json::from_str(&d).ok())
                                    .unwrap_or_default(),
                                group: match group.as_str() {
                                    "admin" => UserGroup::Admin,
                                    "expert" => UserGroup::Expert,
                                    "guest" => UserGroup::Guest,
                                    _ => UserGroup::User,
                                },
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        Ok(profile.unwrap_or_else(|| UserProfile::guest(user_id)))
    }

    /// Insert or replace a user profile.
    pub async fn upsert_profile(&self, profile: UserProfile) -> Result<()> {
        self.call(move |conn| {
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO user_profiles
                 (user_id, nickname, expertise_level, preferred_chart,
                  preferred_time_range, focus_dimensions, user_group, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(user_id) DO UPDATE SET
                     nickname = COALESCE(excluded.nickname, nickname),
                     expertise_level = excluded.expertise_level,
                     preferred_chart = excluded.preferred_chart,
                     preferred_time_range = excluded.preferred_time_range,
                     focus_dimensions = excluded.focus_dimensions,
                     user_group = excluded.user_group,
                     updated_at = excluded.updated_at",
                params![
                    profile.user_id,
                    profile.nickname,
                    profile.expertise_level.as_str(),
                    profile.preferred_chart,
                    profile.preferred_time_range,
                    serde_json::to_string(&profile.focus_dimensions)?,
                    profile.group.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Append a query history entry.
    pub async fn record_query(&self, entry: QueryHistoryEntry) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO user_query_history
                 (user_id, query_text, rewritten_text, query_type, chart_type,
                  dimensions, metrics, time_range, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.user_id,
                    entry.query_text,
                    entry.rewritten_text,
                    entry.query_type,
                    entry.chart_type,
                    serde_json::to_string(&entry.dimensions)?,
                    serde_json::to_string(&entry.metrics)?,
                    entry.time_range,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Aggregate recent query history into an updated profile: the most
    /// frequent dimensions become focus dimensions (up to five), and chart
    /// and time-range preferences follow the dominant mode.
    pub async fn learn_profile(&self, user_id: String) -> Result<UserProfile> {
        let mut profile = self.profile(user_id.clone()).await?;

        let history = self
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT dimensions, metrics, chart_type, time_range
                     FROM user_query_history WHERE user_id = ?1
                     ORDER BY id DESC LIMIT 50",
                )?;
                let rows = stmt.query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        if history.is_empty() {
            return Ok(profile);
        }

        let mut dim_counts: HashMap<String, usize> = HashMap::new();
        let mut chart_counts: HashMap<String, usize> = HashMap::new();
        let mut range_counts: HashMap<String, usize> = HashMap::new();

        for (dims, _metrics, chart, range) in &history {
            if let Some(dims) = dims {
                if let Ok(parsed) = serde_json::from_str::<Vec<String>>(dims) {
                    for dim in parsed {
                        *dim_counts.entry(dim).or_default() += 1;
                    }
                }
            }
            if let Some(chart) = chart {
                *chart_counts.entry(chart.clone()).or_default() += 1;
            }
            if let Some(range) = range {
                *range_counts.entry(range.clone()).or_default() += 1;
            }
        }

        let mut dims: Vec<(String, usize)> = dim_counts.into_iter().collect();
        dims.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        profile.focus_dimensions = dims.into_iter().take(5).map(|(d, _)| d).collect();

        // A chart preference only counts when it dominates recent history.
        let total = history.len();
        if let Some((chart, count)) = chart_counts.into_iter().max_by_key(|(_, c)| *c) {
            if count * 5 >= total * 2 {
                profile.preferred_chart = Some(chart);
            }
        }
        if let Some((range, _)) = range_counts.into_iter().max_by_key(|(_, c)| *c) {
            profile.preferred_time_range = Some(range);
        }

        self.upsert_profile(profile.clone()).await?;
        Ok(profile)
    }
}

fn load_time_rules(conn: &mut Connection) -> Result<Vec<TimeRule>> {
    let mut stmt = conn.prepare(
        "SELECT keyword, rule_type, config, description, priority
         FROM time_rules ORDER BY priority DESC, keyword",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TimeRule {
            keyword: row.get(0)?,
            rule_type: row.get(1)?,
            config: serde_json::from_str(&row.get::<_, String>(2)?)
                .unwrap_or(serde_json::Value::Null),
            description: row.get(3)?,
            priority: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn load_terms(conn: &mut Connection) -> Result<Vec<BusinessTerm>> {
    let mut stmt = conn.prepare(
        "SELECT term, kind, definition, sql_expression, priority
         FROM business_terms ORDER BY priority DESC, term",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BusinessTerm {
            term: row.get(0)?,
            kind: TermKind::parse(&row.get::<_, String>(1)?),
            definition: row.get(2)?,
            sql_expression: row.get(3)?,
            priority: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn load_mappings(conn: &mut Connection) -> Result<Vec<FieldMapping>> {
    let mut stmt = conn.prepare(
        "SELECT display_name, table_name, field_name, field_value, priority
         FROM field_mappings ORDER BY priority DESC, display_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(FieldMapping {
            display_name: row.get(0)?,
            table_name: row.get(1)?,
            field_name: row.get(2)?,
            field_value: row.get(3)?,
            priority: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, KnowledgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::new(dir.path().join("knowledge.sqlite"));
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_default_prompts_seeded_and_active() {
        let (_dir, store) = store().await;
        let active = store
            .active_prompt("system_prompt".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.version, "v1.0");
        assert!(active.content.contains("{schema_summary}"));
    }

    #[tokio::test]
    async fn test_prompt_activation_is_exclusive() {
        let (_dir, store) = store().await;
        store
            .create_prompt(
                "system_prompt".into(),
                "v2.0".into(),
                "new body".into(),
                None,
            )
            .await
            .unwrap();
        assert!(store
            .activate_prompt("system_prompt".into(), "v2.0".into())
            .await
            .unwrap());

        let versions = store
            .list_prompts(Some("system_prompt".into()))
            .await
            .unwrap();
        let active: Vec<_> = versions.iter().filter(|v| v.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, "v2.0");
    }

    #[tokio::test]
    async fn test_activate_unknown_version_is_noop() {
        let (_dir, store) = store().await;
        assert!(!store
            .activate_prompt("system_prompt".into(), "v9.9".into())
            .await
            .unwrap());
        // The previous active version is untouched.
        let active = store
            .active_prompt("system_prompt".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.version, "v1.0");
    }

    #[tokio::test]
    async fn test_snapshot_reloads_on_write() {
        let (_dir, store) = store().await;
        assert!(store.snapshot().terms.is_empty());

        store
            .upsert_term(BusinessTerm {
                term: "访问量".into(),
                kind: TermKind::Metric,
                definition: "visit count".into(),
                sql_expression: None,
                priority: 0,
            })
            .await
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.terms.len(), 1);
        assert!(snapshot.term("访问量").is_some());
    }

    #[tokio::test]
    async fn test_profile_learner_picks_focus_dimensions() {
        let (_dir, store) = store().await;
        for i in 0..6 {
            store
                .record_query(QueryHistoryEntry {
                    user_id: "u1".into(),
                    query_text: format!("q{}", i),
                    rewritten_text: None,
                    query_type: None,
                    chart_type: Some("line".into()),
                    dimensions: vec!["渠道".into(), "日期".into()],
                    metrics: vec!["访问量".into()],
                    time_range: Some("最近7天".into()),
                })
                .await
                .unwrap();
        }

        let profile = store.learn_profile("u1".into()).await.unwrap();
        assert!(profile.focus_dimensions.contains(&"渠道".to_string()));
        assert!(profile.focus_dimensions.len() <= 5);
        assert_eq!(profile.preferred_chart.as_deref(), Some("line"));
        assert_eq!(profile.preferred_time_range.as_deref(), Some("最近7天"));
    }
}
