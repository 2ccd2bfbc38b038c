//! Tabular query executor boundary.
//!
//! The service treats the execution engine as an opaque capability: it
//! runs a validated SQL string and returns rows plus schema. The bundled
//! implementation reads a local SQLite data file; deployments can swap in
//! anything that satisfies [`QueryExecutor`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};

/// Schema of one queryable table.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Column names in declaration order.
    pub columns: Vec<String>,
    /// Approximate row count.
    pub row_count: u64,
}

impl TableSchema {
    /// One-line description used in schema summaries for the LLM.
    pub fn describe(&self) -> String {
        let cols = if self.columns.len() > 10 {
            format!(
                "{} ... ({} columns total)",
                self.columns[..10].join(", "),
                self.columns.len()
            )
        } else {
            self.columns.join(", ")
        };
        format!("- {} ({} rows): {}", self.name, self.row_count, cols)
    }
}

/// Result of a query execution.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    /// Column names.
    pub columns: Vec<String>,
    /// Row values as JSON scalars.
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Opaque capability that runs validated SQL.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// List the queryable tables and their columns.
    async fn schema(&self) -> Result<Vec<TableSchema>>;

    /// Execute a validated SQL statement.
    async fn run_query(&self, sql: &str) -> Result<QueryOutput>;
}

/// SQLite-backed executor over a read-only data file.
pub struct SqliteExecutor {
    db_path: PathBuf,
    sqlite: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutor")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl SqliteExecutor {
    /// Create an executor over the given data file.
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            sqlite: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the data file read-only. Missing files are tolerated; the
    /// executor then reports an empty schema and fails queries.
    pub async fn init(&self) -> Result<()> {
        let sqlite = self.sqlite.clone();
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = sqlite.lock().unwrap();
            if guard.is_none() && db_path.exists() {
                let conn = Connection::open_with_flags(
                    &db_path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
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
                .ok_or_else(|| anyhow::anyhow!("data database not available"))?;
            f(conn)
        })
        .await
        .context("spawn_blocking failed")?
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn schema(&self) -> Result<Vec<TableSchema>> {
        {
            let guard = self.sqlite.lock().unwrap();
            if guard.is_none() {
                return Ok(Vec::new());
            }
        }

        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )?;
            let names: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<_>>()?;

            let mut tables = Vec::with_capacity(names.len());
            for name in names {
                let mut info = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name))?;
                let columns: Vec<String> = info
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<rusqlite::Result<_>>()?;
                let row_count: u64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM \"{}\"", name),
                    [],
                    |row| row.get(0),
                )?;
                tables.push(TableSchema {
                    name,
                    columns,
                    row_count,
                });
            }
            Ok(tables)
        })
        .await
    }

    async fn run_query(&self, sql: &str) -> Result<QueryOutput> {
        let sql = sql.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let column_count = columns.len();

            let mut rows = Vec::new();
            let mut raw = stmt.query([])?;
            while let Some(row) = raw.next()? {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value = match row.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                        rusqlite::types::ValueRef::Integer(v) => serde_json::Value::from(v),
                        rusqlite::types::ValueRef::Real(v) => serde_json::Value::from(v),
                        rusqlite::types::ValueRef::Text(v) => {
                            serde_json::Value::from(String::from_utf8_lossy(v).to_string())
                        }
                        rusqlite::types::ValueRef::Blob(v) => {
                            serde_json::Value::from(format!("<blob {} bytes>", v.len()))
                        }
                    };
                    values.push(value);
                }
                rows.push(values);
            }

            Ok(QueryOutput { columns, rows })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn executor_with_data() -> (tempfile::TempDir, SqliteExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE gio_event (event_date TEXT, channel TEXT, visits INTEGER);
                 INSERT INTO gio_event VALUES ('2024-01-01', 'app', 100);
                 INSERT INTO gio_event VALUES ('2024-01-02', 'web', 80);",
            )
            .unwrap();
        }
        let executor = SqliteExecutor::new(path);
        executor.init().await.unwrap();
        (dir, executor)
    }

    #[tokio::test]
    async fn test_schema_lists_tables_and_columns() {
        let (_dir, executor) = executor_with_data().await;
        let schema = executor.schema().await.unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].name, "gio_event");
        assert_eq!(schema[0].row_count, 2);
        assert!(schema[0].columns.contains(&"visits".to_string()));
    }

    #[tokio::test]
    async fn test_run_query_returns_typed_rows() {
        let (_dir, executor) = executor_with_data().await;
        let output = executor
            .run_query("SELECT event_date, visits FROM gio_event ORDER BY event_date")
            .await
            .unwrap();
        assert_eq!(output.columns, vec!["event_date", "visits"]);
        assert_eq!(output.rows[0][1], serde_json::json!(100));
    }

    #[tokio::test]
    async fn test_missing_data_file_reports_empty_schema() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SqliteExecutor::new(dir.path().join("missing.sqlite"));
        executor.init().await.unwrap();
        assert!(executor.schema().await.unwrap().is_empty());
        assert!(executor.run_query("SELECT 1").await.is_err());
    }
}
