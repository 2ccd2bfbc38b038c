//! Semantic tokenization.
//!
//! Splits a question into typed, non-overlapping spans by greedy
//! longest-match over the knowledge dictionaries and built-in keyword
//! tables. Compound phrases must match before their constituent words;
//! unmatched remainder becomes plain tokens. The concatenation of all
//! tokens reconstructs the original question byte-for-byte.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::events::ChartType;
use crate::knowledge::KnowledgeSnapshot;

/// Type tag of a semantic token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// A time expression (最近7天, 本月).
    TimeRule,
    /// A period comparison (环比, 同比).
    Comparison,
    /// A business term from the glossary.
    Term,
    /// A field alias mapping to a concrete value.
    FieldMapping,
    /// A chart preference phrase (变化趋势, 分布情况).
    ChartHint,
    /// A metric keyword (访问量, GMV).
    Metric,
    /// An analysis dimension (渠道, 省份).
    Dimension,
    /// A sort cue (最高的, 排名).
    Sort,
    /// Untagged text.
    Plain,
}

/// Knowledge payload attached to a matched token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenKnowledge {
    /// Description of what the span means.
    pub description: String,
    /// Canonical value (resolved window, chart type, field value).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A classified substring span `[start, end)` of the original question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticToken {
    /// The matched text, exactly as it appears in the question.
    pub text: String,
    /// Type tag.
    pub kind: TokenKind,
    /// Byte offset of the span start.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// Attached knowledge, absent on plain tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge: Option<TokenKnowledge>,
}

/// Chart-hint phrases. Compound forms come first so they win over their
/// constituent words at equal scan priority; within the list, matching is
/// longest-first with insertion order breaking ties.
const CHART_KEYWORDS: &[(&str, ChartType, &str)] = &[
    ("变化趋势", ChartType::Line, "line chart"),
    ("趋势变化", ChartType::Line, "line chart"),
    ("走势变化", ChartType::Line, "line chart"),
    ("分布情况", ChartType::Pie, "pie chart"),
    ("占比分布", ChartType::Pie, "pie chart"),
    ("分布占比", ChartType::Pie, "pie chart"),
    ("排名对比", ChartType::Bar, "bar chart"),
    ("对比排名", ChartType::Bar, "bar chart"),
    ("趋势", ChartType::Line, "line chart"),
    ("走势", ChartType::Line, "line chart"),
    ("变化", ChartType::Line, "line chart"),
    ("对比", ChartType::Bar, "bar chart"),
    ("比较", ChartType::Bar, "bar chart"),
    ("排名", ChartType::Bar, "bar chart"),
    ("排行", ChartType::Bar, "bar chart"),
    ("占比", ChartType::Pie, "pie chart"),
    ("分布", ChartType::Pie, "pie chart"),
    ("构成", ChartType::Pie, "pie chart"),
    ("比例", ChartType::Pie, "pie chart"),
];

/// Period-comparison keywords, compound forms first.
const COMPARISON_KEYWORDS: &[(&str, &str, &str)] = &[
    ("周环比", "wow", "versus the previous week"),
    ("月环比", "mom", "versus the previous month"),
    ("年同比", "yoy", "versus the same period last year"),
    ("环比", "mom", "versus the previous period"),
    ("同比", "yoy", "versus the same period last year"),
];

/// Sort cues, compound forms first.
const SORT_KEYWORDS: &[(&str, &str, &str)] = &[
    ("最高的", "desc", "sort descending"),
    ("最大的", "desc", "sort descending"),
    ("最多的", "desc", "sort descending"),
    ("最低的", "asc", "sort ascending"),
    ("最小的", "asc", "sort ascending"),
    ("最少的", "asc", "sort ascending"),
    ("最高", "desc", "sort descending"),
    ("最大", "desc", "sort descending"),
    ("最多", "desc", "sort descending"),
    ("最低", "asc", "sort ascending"),
    ("最小", "asc", "sort ascending"),
    ("最少", "asc", "sort ascending"),
    ("排名", "desc", "ranking order"),
    ("排行", "desc", "ranking order"),
    ("top", "desc", "top-N order"),
];

/// Built-in metric keywords with descriptions. Matched case-insensitively.
const METRIC_KEYWORDS: &[(&str, &str)] = &[
    ("销售额", "revenue amount"),
    ("访问量", "visit count"),
    ("浏览量", "page view count"),
    ("点击量", "click count"),
    ("订单数", "order count"),
    ("用户数", "user count"),
    ("转化率", "conversion rate"),
    ("点击率", "click-through rate"),
    ("跳出率", "bounce rate"),
    ("销量", "sales volume"),
    ("收入", "revenue"),
    ("营收", "revenue"),
    ("利润", "profit"),
    ("金额", "amount"),
    ("订单", "order count"),
    ("日活", "daily active users"),
    ("月活", "monthly active users"),
    ("gmv", "gross merchandise volume"),
    ("dau", "daily active users"),
    ("mau", "monthly active users"),
    ("uv", "unique visitors"),
    ("pv", "page views"),
];

/// Built-in dimension keywords with descriptions.
const DIMENSION_KEYWORDS: &[(&str, &str)] = &[
    ("经销商", "business entity dimension"),
    ("渠道", "traffic source dimension"),
    ("来源", "traffic source dimension"),
    ("城市", "geographic dimension"),
    ("地区", "geographic dimension"),
    ("省份", "geographic dimension"),
    ("区域", "geographic dimension"),
    ("门店", "business entity dimension"),
    ("店铺", "business entity dimension"),
    ("品牌", "product dimension"),
    ("品类", "product dimension"),
    ("商品", "product dimension"),
    ("产品", "product dimension"),
    ("用户", "user dimension"),
    ("客户", "user dimension"),
    ("会员", "user dimension"),
    ("日期", "time dimension"),
    ("月份", "time dimension"),
    ("年份", "time dimension"),
    ("季度", "time dimension"),
    ("时间", "time dimension"),
    ("页面", "behavior dimension"),
    ("事件", "behavior dimension"),
    ("设备", "device dimension"),
    ("平台", "platform dimension"),
];

/// Supplementary time words not expected in the rule dictionary.
const TIME_KEYWORDS: &[(&str, &str)] = &[
    ("近期", "recent period"),
    ("最近", "recent period"),
    ("过去", "past period"),
    ("历史", "historical data"),
];

fn time_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"最近\d+[天日周月年]", "rolling window"),
            (r"近\d+[天日周月年]", "rolling window"),
            (r"过去\d+[天日周月年]", "rolling window"),
            (r"前\d+[天日周月年]", "rolling window"),
            (r"\d{4}[-/年]\d{1,2}[-/月]\d{1,2}[日号]?", "calendar date"),
            (r"\d{4}[-/年]\d{1,2}月?", "calendar month"),
            (r"今[天日]", "today"),
            (r"昨[天日]", "yesterday"),
            (r"前[天日]", "the day before yesterday"),
            (r"本[周月季年]", "current period"),
            (r"上[周月季年]", "previous period"),
            (r"去[年月]", "previous year or month"),
        ]
        .iter()
        .map(|(pattern, label)| {
            (
                Regex::new(pattern).expect("invalid time pattern"),
                *label,
            )
        })
        .collect()
    })
}

fn stat_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"按(.+?)(统计|分组|聚合|汇总|分类)",
            r"(?i)\bgroup\s+by\s+(\w+)\b",
            r"(?i)\bby\s+(day|date|month|year|week|hour)\b",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("invalid stat pattern"))
        .collect()
    })
}

fn number_time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+[天日周月年]").expect("invalid pattern"))
}

/// Tokenizer over the current knowledge snapshot.
pub struct Tokenizer<'a> {
    snapshot: &'a KnowledgeSnapshot,
}

impl<'a> Tokenizer<'a> {
    /// Create a tokenizer over a snapshot.
    pub fn new(snapshot: &'a KnowledgeSnapshot) -> Self {
        Self { snapshot }
    }

    /// Tokenize a question into non-overlapping typed spans plus plain
    /// gap tokens.
    pub fn tokenize(&self, question: &str) -> Vec<SemanticToken> {
        let mut tokens: Vec<SemanticToken> = Vec::new();

        // 1. Time rules from the knowledge store, longest first.
        for rule in &self.snapshot.time_rules {
            if let Some(start) = find_free(question, &rule.keyword, &tokens) {
                let end = start + rule.keyword.len();
                tokens.push(SemanticToken {
                    text: rule.keyword.clone(),
                    kind: TokenKind::TimeRule,
                    start,
                    end,
                    knowledge: Some(TokenKnowledge {
                        description: rule
                            .description
                            .clone()
                            .unwrap_or_else(|| rule.resolve()),
                        value: Some(rule.resolve()),
                    }),
                });
            }
        }

        // 2. Regex time patterns (rolling windows, calendar dates).
        for (pattern, label) in time_patterns() {
            for m in pattern.find_iter(question) {
                if span_free(m.start(), m.end(), &tokens) {
                    tokens.push(SemanticToken {
                        text: m.as_str().to_string(),
                        kind: TokenKind::TimeRule,
                        start: m.start(),
                        end: m.end(),
                        knowledge: Some(TokenKnowledge {
                            description: label.to_string(),
                            value: Some(m.as_str().to_string()),
                        }),
                    });
                }
            }
        }

        // 3. Supplementary time words.
        for (keyword, label) in TIME_KEYWORDS {
            if let Some(start) = find_free(question, keyword, &tokens) {
                tokens.push(SemanticToken {
                    text: (*keyword).to_string(),
                    kind: TokenKind::TimeRule,
                    start,
                    end: start + keyword.len(),
                    knowledge: Some(TokenKnowledge {
                        description: label.to_string(),
                        value: None,
                    }),
                });
            }
        }

        // 4. Grouping patterns: the dimension token spans the grouping
        //    particle plus the dimension word ("按日期" of "按日期统计").
        for pattern in stat_patterns() {
            for caps in pattern.captures_iter(question) {
                let Some(dim) = caps.get(1) else { continue };
                let full = caps.get(0).map(|m| m.start()).unwrap_or(dim.start());
                let start = full;
                let end = dim.end();
                if span_free(start, end, &tokens) {
                    tokens.push(SemanticToken {
                        text: question[start..end].to_string(),
                        kind: TokenKind::Dimension,
                        start,
                        end,
                        knowledge: Some(TokenKnowledge {
                            description: format!("group by {}", dim.as_str()),
                            value: Some(dim.as_str().to_string()),
                        }),
                    });
                }
            }
        }

        // 5. Bare number+unit time expressions ("7天") not already covered
        //    by a longer rolling-window match.
        for m in number_time_pattern().find_iter(question) {
            if span_free(m.start(), m.end(), &tokens) {
                tokens.push(SemanticToken {
                    text: m.as_str().to_string(),
                    kind: TokenKind::TimeRule,
                    start: m.start(),
                    end: m.end(),
                    knowledge: Some(TokenKnowledge {
                        description: "time span".to_string(),
                        value: Some(m.as_str().to_string()),
                    }),
                });
            }
        }

        // 6. Period comparisons.
        for (keyword, value, label) in COMPARISON_KEYWORDS {
            if let Some(start) = find_free(question, keyword, &tokens) {
                tokens.push(SemanticToken {
                    text: (*keyword).to_string(),
                    kind: TokenKind::Comparison,
                    start,
                    end: start + keyword.len(),
                    knowledge: Some(TokenKnowledge {
                        description: label.to_string(),
                        value: Some((*value).to_string()),
                    }),
                });
            }
        }

        // 7. Business terms, longest first per the snapshot ordering.
        for term in &self.snapshot.terms {
            if let Some(start) = find_free(question, &term.term, &tokens) {
                tokens.push(SemanticToken {
                    text: term.term.clone(),
                    kind: TokenKind::Term,
                    start,
                    end: start + term.term.len(),
                    knowledge: Some(TokenKnowledge {
                        description: term.definition.clone(),
                        value: term.sql_expression.clone(),
                    }),
                });
            }
        }

        // 8. Field aliases, matched after business terms.
        for mapping in &self.snapshot.field_mappings {
            if let Some(start) = find_free(question, &mapping.display_name, &tokens) {
                tokens.push(SemanticToken {
                    text: mapping.display_name.clone(),
                    kind: TokenKind::FieldMapping,
                    start,
                    end: start + mapping.display_name.len(),
                    knowledge: Some(TokenKnowledge {
                        description: mapping.describe(),
                        value: Some(mapping.field_value.clone()),
                    }),
                });
            }
        }

        // 9. Chart hints; the compound-first table order is the hard rule
        //    that keeps "变化趋势" one token.
        for (keyword, chart, label) in CHART_KEYWORDS {
            if let Some(start) = find_free(question, keyword, &tokens) {
                tokens.push(SemanticToken {
                    text: (*keyword).to_string(),
                    kind: TokenKind::ChartHint,
                    start,
                    end: start + keyword.len(),
                    knowledge: Some(TokenKnowledge {
                        description: label.to_string(),
                        value: Some(
                            serde_json::to_value(chart)
                                .ok()
                                .and_then(|v| v.as_str().map(String::from))
                                .unwrap_or_default(),
                        ),
                    }),
                });
            }
        }

        // 10. Metrics, case-insensitive on the ASCII entries (PV, DAU).
        for (keyword, description) in METRIC_KEYWORDS {
            if let Some(start) = find_free_ignore_ascii_case(question, keyword, &tokens) {
                let end = start + keyword.len();
                tokens.push(SemanticToken {
                    text: question[start..end].to_string(),
                    kind: TokenKind::Metric,
                    start,
                    end,
                    knowledge: Some(TokenKnowledge {
                        description: (*description).to_string(),
                        value: Some(if keyword.is_ascii() {
                            keyword.to_uppercase()
                        } else {
                            (*keyword).to_string()
                        }),
                    }),
                });
            }
        }

        // 11. Sort cues.
        for (keyword, value, label) in SORT_KEYWORDS {
            if let Some(start) = find_free_ignore_ascii_case(question, keyword, &tokens) {
                let end = start + keyword.len();
                tokens.push(SemanticToken {
                    text: question[start..end].to_string(),
                    kind: TokenKind::Sort,
                    start,
                    end,
                    knowledge: Some(TokenKnowledge {
                        description: label.to_string(),
                        value: Some((*value).to_string()),
                    }),
                });
            }
        }

        // 12. Dimensions.
        for (keyword, description) in DIMENSION_KEYWORDS {
            if let Some(start) = find_free(question, keyword, &tokens) {
                tokens.push(SemanticToken {
                    text: (*keyword).to_string(),
                    kind: TokenKind::Dimension,
                    start,
                    end: start + keyword.len(),
                    knowledge: Some(TokenKnowledge {
                        description: (*description).to_string(),
                        value: Some((*keyword).to_string()),
                    }),
                });
            }
        }

        tokens.sort_by_key(|t| t.start);
        fill_gaps(question, tokens)
    }
}

/// Find the first occurrence of `keyword` whose span does not overlap any
/// existing token. Returns the byte offset.
fn find_free(question: &str, keyword: &str, tokens: &[SemanticToken]) -> Option<usize> {
    if keyword.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(pos) = question[from..].find(keyword) {
        let start = from + pos;
        let end = start + keyword.len();
        if span_free(start, end, tokens) {
            return Some(start);
        }
        from = start + keyword.len();
    }
    None
}

/// Case-insensitive variant for ASCII keywords; preserves the original
/// casing in the matched span.
fn find_free_ignore_ascii_case(
    question: &str,
    keyword: &str,
    tokens: &[SemanticToken],
) -> Option<usize> {
    if keyword.is_ascii() {
        let lowered: String = question
            .chars()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        find_free(&lowered, &keyword.to_ascii_lowercase(), tokens)
    } else {
        find_free(question, keyword, tokens)
    }
}

fn span_free(start: usize, end: usize, tokens: &[SemanticToken]) -> bool {
    tokens.iter().all(|t| end <= t.start || start >= t.end)
}

/// Fill untagged gaps with plain tokens so the spans reconstruct the
/// question exactly.
fn fill_gaps(question: &str, tokens: Vec<SemanticToken>) -> Vec<SemanticToken> {
    let mut out = Vec::with_capacity(tokens.len() * 2);
    let mut cursor = 0;
    for token in tokens {
        if token.start > cursor {
            out.push(SemanticToken {
                text: question[cursor..token.start].to_string(),
                kind: TokenKind::Plain,
                start: cursor,
                end: token.start,
                knowledge: None,
            });
        }
        cursor = token.end;
        out.push(token);
    }
    if cursor < question.len() {
        out.push(SemanticToken {
            text: question[cursor..].to_string(),
            kind: TokenKind::Plain,
            start: cursor,
            end: question.len(),
            knowledge: None,
        });
    }
    out
}

/// Reconstruct the original question from a token sequence.
pub fn reconstruct(tokens: &[SemanticToken]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{BusinessTerm, FieldMapping, TermKind, TimeRule};

    fn snapshot() -> KnowledgeSnapshot {
        KnowledgeSnapshot::new(
            vec![TimeRule {
                keyword: "本周".into(),
                rule_type: "recent_days".into(),
                config: serde_json::json!({"days": 7}),
                description: Some("current week".into()),
                priority: 0,
            }],
            vec![BusinessTerm {
                term: "专辑".into(),
                kind: TermKind::Entity,
                definition: "an album entity".into(),
                sql_expression: None,
                priority: 0,
            }],
            vec![FieldMapping {
                display_name: "小说频道".into(),
                table_name: "gio_event".into(),
                field_name: "channel".into(),
                field_value: "novel".into(),
                priority: 0,
            }],
        )
    }

    fn kinds(tokens: &[SemanticToken]) -> Vec<(TokenKind, &str)> {
        tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Plain)
            .map(|t| (t.kind, t.text.as_str()))
            .collect()
    }

    #[test]
    fn test_compound_chart_hint_stays_whole() {
        let snapshot = KnowledgeSnapshot::default();
        let tokenizer = Tokenizer::new(&snapshot);
        let question = "最近7天按日期统计访问量的变化趋势";
        let tokens = tokenizer.tokenize(question);

        let tagged = kinds(&tokens);
        assert!(tagged.contains(&(TokenKind::TimeRule, "最近7天")));
        assert!(tagged.contains(&(TokenKind::Dimension, "按日期")));
        assert!(tagged.contains(&(TokenKind::Metric, "访问量")));
        assert!(tagged.contains(&(TokenKind::ChartHint, "变化趋势")));
        // The compound must not be split into its constituent words.
        assert!(!tagged.contains(&(TokenKind::ChartHint, "变化")));
        assert!(!tagged.contains(&(TokenKind::ChartHint, "趋势")));

        let hint = tokens
            .iter()
            .find(|t| t.kind == TokenKind::ChartHint)
            .unwrap();
        assert_eq!(
            hint.knowledge.as_ref().unwrap().value.as_deref(),
            Some("line")
        );
    }

    #[test]
    fn test_tokens_reconstruct_question_exactly() {
        let snapshot = snapshot();
        let tokenizer = Tokenizer::new(&snapshot);
        for question in [
            "最近7天按日期统计访问量的变化趋势",
            "本周小说频道的专辑DAU趋势如何？环比？",
            "2024年1月各渠道销售额排名对比",
            "hello world",
            "",
        ] {
            let tokens = tokenizer.tokenize(question);
            assert_eq!(reconstruct(&tokens), question, "question: {}", question);
            // Spans are non-overlapping and contiguous.
            let mut cursor = 0;
            for token in &tokens {
                assert_eq!(token.start, cursor, "gap before {:?}", token);
                cursor = token.end;
            }
            assert_eq!(cursor, question.len());
        }
    }

    #[test]
    fn test_knowledge_dictionaries_take_precedence() {
        let snapshot = snapshot();
        let tokenizer = Tokenizer::new(&snapshot);
        let tokens = tokenizer.tokenize("本周小说频道的专辑DAU趋势如何？环比？");

        let tagged = kinds(&tokens);
        assert!(tagged.contains(&(TokenKind::TimeRule, "本周")));
        assert!(tagged.contains(&(TokenKind::FieldMapping, "小说频道")));
        assert!(tagged.contains(&(TokenKind::Term, "专辑")));
        assert!(tagged.contains(&(TokenKind::Metric, "DAU")));
        assert!(tagged.contains(&(TokenKind::ChartHint, "趋势")));
        assert!(tagged.contains(&(TokenKind::Comparison, "环比")));
    }

    #[test]
    fn test_sort_cue_detected() {
        let snapshot = KnowledgeSnapshot::default();
        let tokenizer = Tokenizer::new(&snapshot);
        let tokens = tokenizer.tokenize("销量最高的10个商品");
        let tagged = kinds(&tokens);
        assert!(tagged.contains(&(TokenKind::Sort, "最高的")));
        assert!(tagged.contains(&(TokenKind::Metric, "销量")));
        assert!(tagged.contains(&(TokenKind::Dimension, "商品")));
    }

    #[test]
    fn test_case_insensitive_metric_preserves_original_case() {
        let snapshot = KnowledgeSnapshot::default();
        let tokenizer = Tokenizer::new(&snapshot);
        let tokens = tokenizer.tokenize("昨天的Pv是多少");
        let metric = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Metric)
            .unwrap();
        assert_eq!(metric.text, "Pv");
        assert_eq!(
            metric.knowledge.as_ref().unwrap().value.as_deref(),
            Some("PV")
        );
    }

    #[test]
    fn test_identical_questions_tokenize_identically() {
        let snapshot = snapshot();
        let tokenizer = Tokenizer::new(&snapshot);
        let question = "最近7天按日期统计访问量的变化趋势";
        let first = tokenizer.tokenize(question);
        let second = tokenizer.tokenize(question);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
