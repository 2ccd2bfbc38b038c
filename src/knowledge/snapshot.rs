//! Immutable knowledge snapshot for lock-free reads.
//!
//! The analyzer tokenizes every question against the dictionaries, so the
//! hot path must not take the store's write lock. Each successful write
//! rebuilds a full snapshot; readers load it through `ArcSwap`.

use super::{BusinessTerm, FieldMapping, TimeRule};

/// An immutable view of the matchable dictionaries.
#[derive(Debug, Default)]
pub struct KnowledgeSnapshot {
    /// Time rules, longest keyword first, insertion order preserved on ties.
    pub time_rules: Vec<TimeRule>,
    /// Business terms, longest first.
    pub terms: Vec<BusinessTerm>,
    /// Field mappings, longest first.
    pub field_mappings: Vec<FieldMapping>,
}

impl KnowledgeSnapshot {
    /// Build a snapshot, ordering each dictionary longest-keyword-first so
    /// greedy matching prefers compound entries. The sort is stable: on
    /// equal length the earlier-inserted entry wins.
    pub fn new(
        mut time_rules: Vec<TimeRule>,
        mut terms: Vec<BusinessTerm>,
        mut field_mappings: Vec<FieldMapping>,
    ) -> Self {
        time_rules.sort_by(|a, b| {
            b.keyword
                .chars()
                .count()
                .cmp(&a.keyword.chars().count())
                .then(b.priority.cmp(&a.priority))
        });
        terms.sort_by(|a, b| {
            b.term
                .chars()
                .count()
                .cmp(&a.term.chars().count())
                .then(b.priority.cmp(&a.priority))
        });
        field_mappings.sort_by(|a, b| {
            b.display_name
                .chars()
                .count()
                .cmp(&a.display_name.chars().count())
                .then(b.priority.cmp(&a.priority))
        });

        Self {
            time_rules,
            terms,
            field_mappings,
        }
    }

    /// Look up a business term by its exact keyword.
    pub fn term(&self, keyword: &str) -> Option<&BusinessTerm> {
        self.terms.iter().find(|t| t.term == keyword)
    }

    /// Look up a field mapping by its display name.
    pub fn mapping(&self, display_name: &str) -> Option<&FieldMapping> {
        self.field_mappings
            .iter()
            .find(|m| m.display_name == display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::TermKind;

    fn term(name: &str, priority: i64) -> BusinessTerm {
        BusinessTerm {
            term: name.to_string(),
            kind: TermKind::Metric,
            definition: String::new(),
            sql_expression: None,
            priority,
        }
    }

    #[test]
    fn test_longest_first_ordering() {
        let snapshot = KnowledgeSnapshot::new(
            Vec::new(),
            vec![term("DAU", 0), term("专辑DAU", 0), term("月活", 0)],
            Vec::new(),
        );
        assert_eq!(snapshot.terms[0].term, "专辑DAU");
    }

    #[test]
    fn test_equal_length_prefers_higher_priority() {
        let snapshot = KnowledgeSnapshot::new(
            Vec::new(),
            vec![term("销量", 1), term("订单", 5)],
            Vec::new(),
        );
        assert_eq!(snapshot.terms[0].term, "订单");
    }
}
