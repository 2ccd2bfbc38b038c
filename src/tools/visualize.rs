//! The `visualize_data` tool.
//!
//! Produces a chart descriptor for a stored dataframe without rendering
//! anything. Axis keys are inferred from the artifact's columns; the chart
//! type follows the explicit hint, then the analyzer's hint, then a
//! heuristic over the data shape.

use std::sync::Arc;

use async_trait::async_trait;

use crate::artifacts::ArtifactStore;
use crate::events::{ChartType, ChatEvent};
use crate::executor::QueryOutput;
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolOutput};

/// Suggests a chart for a stored query result.
pub struct VisualizeDataTool {
    artifacts: Arc<ArtifactStore>,
}

impl VisualizeDataTool {
    /// Create the tool.
    pub fn new(artifacts: Arc<ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl Tool for VisualizeDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "visualize_data",
            "Suggest a chart for a previously produced dataframe. Pass the \
             fileHash from a run_sql result and optionally a chart type \
             hint (line, bar, pie).",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "file_hash": {
                        "type": "string",
                        "description": "Artifact hash of the dataframe to visualize"
                    },
                    "chart_type_hint": {
                        "type": "string",
                        "enum": ["line", "bar", "pie", "table"],
                        "description": "Preferred chart type, if any"
                    },
                    "title": {
                        "type": "string",
                        "description": "Chart title"
                    }
                },
                "required": ["file_hash"]
            }),
        )
    }

    async fn execute(&self, arguments: &str, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let args: serde_json::Value = serde_json::from_str(arguments)
            .map_err(|e| anyhow::anyhow!("invalid visualize_data arguments: {}", e))?;
        let file_hash = args["file_hash"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing file_hash argument"))?
            .to_string();

        let output = self.artifacts.read_preview(&file_hash, 50)?;
        if output.columns.is_empty() {
            anyhow::bail!("dataframe {} has no columns", file_hash);
        }

        let (x_key, y_key) = pick_axes(&output);

        let hint: Option<ChartType> = args["chart_type_hint"]
            .as_str()
            .and_then(|s| serde_json::from_value(serde_json::Value::String(s.to_string())).ok());
        let chart_type = hint
            .or(ctx.chart_hint)
            .unwrap_or_else(|| infer_chart_type(&output, &x_key));

        let title = args["title"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("{} by {}", y_key, x_key));

        let descriptor = serde_json::json!({
            "type": chart_type,
            "xKey": x_key.clone(),
            "yKey": y_key.clone(),
            "title": title.clone(),
            "fileHash": file_hash.clone(),
        });

        Ok(ToolOutput {
            content: descriptor.to_string(),
            events: vec![ChatEvent::Chart {
                chart_type,
                x_key,
                y_key,
                title,
                file_hash: Some(file_hash.clone()),
            }],
            sql: None,
            file_hash: Some(file_hash),
        })
    }
}

/// Pick X (first non-numeric column) and Y (first numeric column) keys.
fn pick_axes(output: &QueryOutput) -> (String, String) {
    let numeric: Vec<bool> = (0..output.columns.len())
        .map(|i| {
            output
                .rows
                .iter()
                .filter_map(|row| row.get(i))
                .any(|v| v.is_number())
        })
        .collect();

    let x_key = output
        .columns
        .iter()
        .zip(&numeric)
        .find(|(_, is_num)| !**is_num)
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| output.columns[0].clone());

    let y_key = output
        .columns
        .iter()
        .zip(&numeric)
        .find(|(name, is_num)| **is_num && **name != x_key)
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| output.columns.last().cloned().unwrap_or_default());

    (x_key, y_key)
}

/// Infer a chart type from the data shape: date-like X axes suggest a
/// line, small categorical sets a pie, anything else a bar.
fn infer_chart_type(output: &QueryOutput, x_key: &str) -> ChartType {
    let x_index = output
        .columns
        .iter()
        .position(|c| c == x_key)
        .unwrap_or(0);

    let looks_like_date = output.rows.iter().take(5).all(|row| {
        row.get(x_index)
            .and_then(|v| v.as_str())
            .is_some_and(is_date_like)
    }) && !output.rows.is_empty();

    if looks_like_date {
        ChartType::Line
    } else if output.rows.len() <= 6 && !output.rows.is_empty() {
        ChartType::Pie
    } else {
        ChartType::Bar
    }
}

fn is_date_like(value: &str) -> bool {
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    digits >= 6 && value.chars().all(|c| c.is_ascii_digit() || "-/: ".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trend_output() -> QueryOutput {
        QueryOutput {
            columns: vec!["event_date".into(), "visits".into()],
            rows: (1..=9)
                .map(|d| vec![format!("2024-01-0{}", d).into(), (d * 10).into()])
                .collect(),
        }
    }

    #[test]
    fn test_pick_axes_prefers_text_x_numeric_y() {
        let (x, y) = pick_axes(&trend_output());
        assert_eq!(x, "event_date");
        assert_eq!(y, "visits");
    }

    #[test]
    fn test_date_axis_infers_line() {
        let output = trend_output();
        assert_eq!(infer_chart_type(&output, "event_date"), ChartType::Line);
    }

    #[test]
    fn test_small_categorical_infers_pie() {
        let output = QueryOutput {
            columns: vec!["channel".into(), "visits".into()],
            rows: vec![
                vec!["app".into(), 60.into()],
                vec!["web".into(), 40.into()],
            ],
        };
        assert_eq!(infer_chart_type(&output, "channel"), ChartType::Pie);
    }

    #[tokio::test]
    async fn test_visualize_missing_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().to_path_buf()));
        artifacts.init().unwrap();
        let tool = VisualizeDataTool::new(artifacts);

        let ctx = ToolContext {
            user_id: "u1".into(),
            deadline: std::time::Instant::now() + std::time::Duration::from_secs(60),
            chart_hint: None,
        };
        let result = tool
            .execute("{\"file_hash\":\"abcd1234\"}", &ctx)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_visualize_stored_dataframe() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().to_path_buf()));
        artifacts.init().unwrap();
        let hash = artifacts.store(&trend_output()).unwrap();
        let tool = VisualizeDataTool::new(artifacts);

        let ctx = ToolContext {
            user_id: "u1".into(),
            deadline: std::time::Instant::now() + std::time::Duration::from_secs(60),
            chart_hint: None,
        };
        let output = tool
            .execute(&format!("{{\"file_hash\":\"{}\"}}", hash), &ctx)
            .await
            .unwrap();

        assert_eq!(output.events.len(), 1);
        match &output.events[0] {
            ChatEvent::Chart {
                chart_type, x_key, ..
            } => {
                assert_eq!(*chart_type, ChartType::Line);
                assert_eq!(x_key, "event_date");
            }
            other => panic!("expected chart event, got {:?}", other),
        }
    }
}
