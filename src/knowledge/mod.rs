//! Durable knowledge store.
//!
//! Time rules, business terms, field aliases, prompt versions, user
//! profiles, and query history live in one SQLite database. Writes go
//! through the store; every successful dictionary write rebuilds an
//! immutable snapshot that the analyzer reads lock-free via atomic swap.

pub mod snapshot;
pub mod store;

pub use snapshot::KnowledgeSnapshot;
pub use store::KnowledgeStore;

use chrono::{Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A named time-expression rule (e.g. "最近7天" -> a rolling window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRule {
    /// Trigger keyword, unique.
    pub keyword: String,
    /// Rule discriminator: "relative", "recent_days", "month", "quarter",
    /// "comparison".
    pub rule_type: String,
    /// Rule parameters (days, offset, comparison kind).
    pub config: serde_json::Value,
    /// Human-readable description.
    pub description: Option<String>,
    /// Match priority; higher wins on equal keyword length.
    pub priority: i64,
}

impl TimeRule {
    /// Resolve the rule into a concrete description relative to now.
    pub fn resolve(&self) -> String {
        let now = Utc::now();
        match self.rule_type.as_str() {
            "relative" => {
                let days = self.config["days"].as_i64().unwrap_or(0);
                let target = now + Duration::days(days);
                target.format("%Y-%m-%d").to_string()
            }
            "recent_days" => {
                let days = self.config["days"].as_i64().unwrap_or(7);
                let start = now - Duration::days(days - 1);
                format!(
                    "{} to {}",
                    start.format("%Y-%m-%d"),
                    now.format("%Y-%m-%d")
                )
            }
            "month" => {
                let offset = self.config["offset"].as_i64().unwrap_or(0);
                let mut year = now.year() as i64;
                let mut month = now.month() as i64 + offset;
                while month <= 0 {
                    month += 12;
                    year -= 1;
                }
                while month > 12 {
                    month -= 12;
                    year += 1;
                }
                format!("{}-{:02}", year, month)
            }
            "quarter" => {
                let offset = self.config["offset"].as_i64().unwrap_or(0);
                let mut year = now.year() as i64;
                let mut quarter = ((now.month() as i64 - 1) / 3 + 1) + offset;
                while quarter <= 0 {
                    quarter += 4;
                    year -= 1;
                }
                while quarter > 4 {
                    quarter -= 4;
                    year += 1;
                }
                format!("{}Q{}", year, quarter)
            }
            "comparison" => match self.config["kind"].as_str() {
                Some("yoy") => "versus the same period last year".to_string(),
                Some("mom") => "versus the previous month".to_string(),
                Some("wow") => "versus the previous week".to_string(),
                _ => "period-over-period comparison".to_string(),
            },
            _ => self.config.to_string(),
        }
    }
}

/// Kind of a business term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermKind {
    /// A measurable quantity (访问量, GMV).
    Metric,
    /// A grouping axis (渠道, 省份).
    Dimension,
    /// A filter predicate.
    Filter,
    /// A business entity (经销商, 专辑).
    Entity,
}

impl TermKind {
    /// Database discriminator string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Dimension => "dimension",
            Self::Filter => "filter",
            Self::Entity => "entity",
        }
    }

    /// Parse from the database discriminator; unknown kinds map to entity.
    pub fn parse(s: &str) -> Self {
        match s {
            "metric" => Self::Metric,
            "dimension" => Self::Dimension,
            "filter" => Self::Filter,
            _ => Self::Entity,
        }
    }
}

/// A glossary entry for a company-specific term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessTerm {
    /// The term as users type it, unique.
    pub term: String,
    /// Term kind.
    pub kind: TermKind,
    /// Definition shown in the glossary.
    pub definition: String,
    /// Optional SQL expression the term expands to.
    pub sql_expression: Option<String>,
    /// Match priority.
    pub priority: i64,
}

/// An alias from a display name to a concrete field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Display name users type, unique.
    pub display_name: String,
    /// Target table.
    pub table_name: String,
    /// Target field.
    pub field_name: String,
    /// Value the display name maps to.
    pub field_value: String,
    /// Match priority.
    pub priority: i64,
}

impl FieldMapping {
    /// Description shown on matched tokens.
    pub fn describe(&self) -> String {
        format!(
            "{}.{} = '{}'",
            self.table_name, self.field_name, self.field_value
        )
    }
}

/// A versioned prompt body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    /// Row ID.
    pub id: i64,
    /// Prompt name; activation scope.
    pub name: String,
    /// Version label, unique per name.
    pub version: String,
    /// Body text with `{placeholder}` substitution points.
    pub content: String,
    /// Optional description.
    pub description: Option<String>,
    /// Whether this version is the active one for its name.
    pub is_active: bool,
}

/// User expertise level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpertiseLevel {
    /// New to data analysis.
    Beginner,
    /// Comfortable with common concepts.
    #[default]
    Intermediate,
    /// Wants terse, technical answers.
    Expert,
}

impl ExpertiseLevel {
    /// Database discriminator string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Expert => "expert",
        }
    }

    /// Parse from the database discriminator.
    pub fn parse(s: &str) -> Self {
        match s {
            "beginner" => Self::Beginner,
            "expert" => Self::Expert,
            _ => Self::Intermediate,
        }
    }
}

/// Derived user group driving tool permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserGroup {
    /// Full access.
    Admin,
    /// Expert user.
    Expert,
    /// Regular user.
    #[default]
    User,
    /// Unauthenticated or unknown user.
    Guest,
}

impl UserGroup {
    /// Database discriminator string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Expert => "expert",
            Self::User => "user",
            Self::Guest => "guest",
        }
    }
}

/// A user profile aggregated from query history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// User identifier.
    pub user_id: String,
    /// Display nickname.
    pub nickname: Option<String>,
    /// Expertise level.
    pub expertise_level: ExpertiseLevel,
    /// Preferred chart type, when the user shows a clear preference.
    pub preferred_chart: Option<String>,
    /// Preferred time range phrase (e.g. "最近7天").
    pub preferred_time_range: Option<String>,
    /// Up to five dimensions the user asks about most.
    pub focus_dimensions: Vec<String>,
    /// Derived group.
    pub group: UserGroup,
}

impl UserProfile {
    /// Default profile for an unknown user.
    pub fn guest(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: None,
            expertise_level: ExpertiseLevel::Intermediate,
            preferred_chart: None,
            preferred_time_range: None,
            focus_dimensions: Vec::new(),
            group: UserGroup::Guest,
        }
    }
}

/// One recorded question in a user's query history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHistoryEntry {
    /// User identifier.
    pub user_id: String,
    /// Raw question text.
    pub query_text: String,
    /// Rewritten question text.
    pub rewritten_text: Option<String>,
    /// Detected query type (trend, ranking, distribution, general).
    pub query_type: Option<String>,
    /// Chart type the turn produced.
    pub chart_type: Option<String>,
    /// Dimension keywords seen in the question.
    pub dimensions: Vec<String>,
    /// Metric keywords seen in the question.
    pub metrics: Vec<String>,
    /// Time range phrase seen in the question.
    pub time_range: Option<String>,
}

/// A knowledge item attached to a matched token or an analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Item kind: "time_rule", "term", "mapping".
    pub kind: String,
    /// The keyword that matched.
    pub keyword: String,
    /// Description shown to the user and the LLM.
    pub description: String,
    /// Canonical value (resolved time window, SQL expression, field value).
    pub value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_days_resolves_to_window() {
        let rule = TimeRule {
            keyword: "最近7天".into(),
            rule_type: "recent_days".into(),
            config: serde_json::json!({"days": 7}),
            description: None,
            priority: 0,
        };
        let resolved = rule.resolve();
        assert!(resolved.contains(" to "), "got {}", resolved);
    }

    #[test]
    fn test_quarter_offset_wraps_year() {
        let rule = TimeRule {
            keyword: "去年同季".into(),
            rule_type: "quarter".into(),
            config: serde_json::json!({"offset": -4}),
            description: None,
            priority: 0,
        };
        let resolved = rule.resolve();
        let this_year = Utc::now().year();
        assert!(resolved.starts_with(&(this_year - 1).to_string()));
    }

    #[test]
    fn test_term_kind_round_trip() {
        for kind in [
            TermKind::Metric,
            TermKind::Dimension,
            TermKind::Filter,
            TermKind::Entity,
        ] {
            assert_eq!(TermKind::parse(kind.as_str()), kind);
        }
    }
}
