//! CSV artifact store.
//!
//! Full query results are written as CSV files keyed by content hash
//! under `{hash}/query_results_{timestamp}.csv`. Writes are atomic
//! (write to a temp file, then rename); reads are lock-free.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::executor::QueryOutput;

/// Store of query-result CSV artifacts keyed by file hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the root directory exists.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating artifact dir {}", self.root.display()))
    }

    /// Write a query result as a CSV artifact and return its file hash.
    ///
    /// Identical results hash to the same artifact; rewriting is harmless
    /// because the content is identical and the rename is atomic.
    pub fn store(&self, output: &QueryOutput) -> Result<String> {
        let csv_bytes = render_csv(output)?;
        let file_hash = hex::encode(&Sha256::digest(&csv_bytes)[..16]);

        let dir = self.root.join(&file_hash);
        std::fs::create_dir_all(&dir)?;

        let file_name = format!(
            "query_results_{}.csv",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let final_path = dir.join(&file_name);
        let tmp_path = dir.join(format!(".{}.tmp", file_name));

        std::fs::write(&tmp_path, &csv_bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;

        Ok(file_hash)
    }

    /// Whether an artifact exists for the given hash.
    pub fn exists(&self, file_hash: &str) -> bool {
        self.find(file_hash).is_some()
    }

    /// Find the CSV path for a file hash.
    pub fn find(&self, file_hash: &str) -> Option<PathBuf> {
        if !valid_hash(file_hash) {
            return None;
        }
        let dir = self.root.join(file_hash);
        let entries = std::fs::read_dir(&dir).ok()?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "csv")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("query_results_"))
            })
            .collect();
        paths.sort();
        paths.pop()
    }

    /// Read an artifact back as columns plus rows.
    pub fn read(&self, file_hash: &str) -> Result<QueryOutput> {
        let path = self
            .find(file_hash)
            .ok_or_else(|| anyhow::anyhow!("artifact not found: {}", file_hash))?;
        read_csv(&path)
    }

    /// Read the first `limit` rows of an artifact.
    pub fn read_preview(&self, file_hash: &str, limit: usize) -> Result<QueryOutput> {
        let mut output = self.read(file_hash)?;
        output.rows.truncate(limit);
        Ok(output)
    }
}

fn valid_hash(file_hash: &str) -> bool {
    !file_hash.is_empty()
        && file_hash.len() <= 64
        && file_hash.chars().all(|c| c.is_ascii_hexdigit())
}

fn render_csv(output: &QueryOutput) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&output.columns)?;
    for row in &output.rows {
        let record: Vec<String> = row.iter().map(render_value).collect();
        writer.write_record(&record)?;
    }
    Ok(writer.into_inner()?)
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read_csv(path: &Path) -> Result<QueryOutput> {
    let mut reader = csv::Reader::from_path(path)?;
    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .map(String::from)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| parse_value(field))
                .collect::<Vec<_>>(),
        );
    }

    Ok(QueryOutput { columns, rows })
}

fn parse_value(field: &str) -> serde_json::Value {
    if field.is_empty() {
        return serde_json::Value::Null;
    }
    if let Ok(int) = field.parse::<i64>() {
        return serde_json::Value::from(int);
    }
    if let Ok(float) = field.parse::<f64>() {
        return serde_json::Value::from(float);
    }
    serde_json::Value::from(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output() -> QueryOutput {
        QueryOutput {
            columns: vec!["event_date".into(), "visits".into()],
            rows: vec![
                vec!["2024-01-01".into(), 100.into()],
                vec!["2024-01-02".into(), 80.into()],
            ],
        }
    }

    #[test]
    fn test_store_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        store.init().unwrap();

        let hash = store.store(&sample_output()).unwrap();
        assert!(store.exists(&hash));

        let output = store.read(&hash).unwrap();
        assert_eq!(output.columns, vec!["event_date", "visits"]);
        assert_eq!(output.rows.len(), 2);
        assert_eq!(output.rows[0][1], serde_json::json!(100));
    }

    #[test]
    fn test_identical_results_share_a_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        store.init().unwrap();

        let h1 = store.store(&sample_output()).unwrap();
        let h2 = store.store(&sample_output()).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_hash_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        store.init().unwrap();
        assert!(store.find("../etc").is_none());
        assert!(store.find("").is_none());
    }

    #[test]
    fn test_read_preview_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf());
        store.init().unwrap();

        let hash = store.store(&sample_output()).unwrap();
        let preview = store.read_preview(&hash, 1).unwrap();
        assert_eq!(preview.rows.len(), 1);
    }
}
