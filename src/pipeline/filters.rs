//! Filter evaluation and director trigger selection.
//!
//! Filters are user-authored regexes over one envelope field. Matching is
//! case-insensitive; a filter whose regex does not compile simply never
//! matches, so one bad rule cannot break routing for the rest.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::mail::EmailEnvelope;

/// Which envelope field a filter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    From,
    To,
    Cc,
    Bcc,
    Subject,
    Body,
    Date,
}

fn default_enabled() -> bool {
    true
}

/// A routing rule: regex over one field, targeting one director.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: String,
    pub field: FilterField,
    #[serde(rename = "regex")]
    pub pattern: String,
    pub director_id: String,
    #[serde(default)]
    pub duplicate_allowed: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Outcome of one filter against one envelope.
#[derive(Debug, Clone, Serialize)]
pub struct FilterEvaluation {
    pub filter: Filter,
    pub matched: bool,
    pub field_value: String,
}

/// Extract the text a filter field matches against.
pub fn field_value(envelope: &EmailEnvelope, field: FilterField) -> String {
    match field {
        FilterField::From => envelope.from.clone(),
        FilterField::To => envelope.to.join(", "),
        FilterField::Cc => envelope.cc.join(", "),
        FilterField::Bcc => envelope.bcc.join(", "),
        FilterField::Subject => envelope.subject.clone(),
        FilterField::Body => [
            envelope.text_body.as_deref(),
            envelope.html_body.as_deref(),
            Some(envelope.snippet.as_str()),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n"),
        FilterField::Date => envelope
            .date
            .map(|d| d.to_rfc3339())
            .unwrap_or_default(),
    }
}

/// Enabled filters with their regexes compiled once.
pub struct FilterSet {
    compiled: Vec<(Filter, Option<Regex>)>,
}

impl FilterSet {
    /// Compile every enabled filter. Bad patterns are kept with no regex.
    pub fn compile(filters: &[Filter]) -> Self {
        let compiled = filters
            .iter()
            .filter(|f| f.enabled)
            .map(|f| {
                let regex = match RegexBuilder::new(&f.pattern).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(filter_id = %f.id, pattern = %f.pattern, error = %e, "Invalid filter regex");
                        None
                    }
                };
                (f.clone(), regex)
            })
            .collect();
        Self { compiled }
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Evaluate every filter, in order, against one envelope.
    pub fn evaluate(&self, envelope: &EmailEnvelope) -> Vec<FilterEvaluation> {
        self.compiled
            .iter()
            .map(|(filter, regex)| {
                let value = field_value(envelope, filter.field);
                let matched = regex.as_ref().is_some_and(|re| re.is_match(&value));
                if matched {
                    debug!(filter_id = %filter.id, email_id = %envelope.id, "Filter matched");
                }
                FilterEvaluation {
                    filter: filter.clone(),
                    matched,
                    field_value: value,
                }
            })
            .collect()
    }
}

/// Evaluate filters against an envelope. Never fails as a whole.
pub fn evaluate(filters: &[Filter], envelope: &EmailEnvelope) -> Vec<FilterEvaluation> {
    FilterSet::compile(filters).evaluate(envelope)
}

/// Turn matches into the ordered list of directors to run for this email.
///
/// Filter order is preserved. Unless a filter allows duplicates, a director
/// already selected for this email is not selected again.
pub fn select_triggers(evaluations: &[FilterEvaluation]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut selected = Vec::new();
    for eval in evaluations.iter().filter(|e| e.matched) {
        let director_id = eval.filter.director_id.as_str();
        let first = seen.insert(director_id);
        if first || eval.filter.duplicate_allowed {
            selected.push(director_id.to_string());
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(id: &str, field: FilterField, pattern: &str, director: &str) -> Filter {
        Filter {
            id: id.into(),
            field,
            pattern: pattern.into(),
            director_id: director.into(),
            duplicate_allowed: false,
            enabled: true,
        }
    }

    fn make_envelope(subject: &str) -> EmailEnvelope {
        EmailEnvelope {
            id: "m1".into(),
            subject: subject.into(),
            from: "billing@vendor.com".into(),
            to: vec!["me@example.com".into(), "ops@example.com".into()],
            snippet: "snippet text".into(),
            text_body: Some("plain body".into()),
            html_body: Some("<p>html body</p>".into()),
            ..Default::default()
        }
    }

    #[test]
    fn match_is_case_insensitive() {
        let evals = evaluate(
            &[filter("f1", FilterField::Subject, "invoice", "d1")],
            &make_envelope("INVOICE due"),
        );
        assert!(evals[0].matched);
        assert_eq!(evals[0].field_value, "INVOICE due");
    }

    #[test]
    fn invalid_regex_never_matches() {
        let evals = evaluate(
            &[
                filter("bad", FilterField::Subject, "(unclosed", "d1"),
                filter("good", FilterField::Subject, "hello", "d2"),
            ],
            &make_envelope("hello (unclosed"),
        );
        assert_eq!(evals.len(), 2);
        assert!(!evals[0].matched);
        assert!(evals[1].matched);
    }

    #[test]
    fn address_fields_are_comma_joined() {
        let env = make_envelope("x");
        assert_eq!(
            field_value(&env, FilterField::To),
            "me@example.com, ops@example.com"
        );
        assert_eq!(field_value(&env, FilterField::Cc), "");
    }

    #[test]
    fn body_joins_text_html_and_snippet() {
        let env = make_envelope("x");
        assert_eq!(
            field_value(&env, FilterField::Body),
            "plain body\n<p>html body</p>\nsnippet text"
        );
    }

    #[test]
    fn disabled_filters_are_skipped() {
        let mut f = filter("f1", FilterField::Subject, ".*", "d1");
        f.enabled = false;
        assert!(evaluate(&[f], &make_envelope("x")).is_empty());
    }

    #[test]
    fn same_director_selected_once_per_email() {
        let filters = vec![
            filter("F1", FilterField::Subject, "invoice", "D"),
            filter("F2", FilterField::Subject, "#\\d+", "D"),
        ];
        let evals = evaluate(&filters, &make_envelope("Invoice #123"));
        assert!(evals.iter().all(|e| e.matched));
        assert_eq!(select_triggers(&evals), vec!["D".to_string()]);
    }

    #[test]
    fn duplicate_allowed_appends_every_match() {
        let mut second = filter("F2", FilterField::Subject, "\\d+", "D");
        second.duplicate_allowed = true;
        let filters = vec![filter("F1", FilterField::Subject, "invoice", "D"), second];
        let evals = evaluate(&filters, &make_envelope("Invoice #123"));
        assert_eq!(select_triggers(&evals), vec!["D", "D"]);
    }

    #[test]
    fn selection_preserves_filter_order() {
        let filters = vec![
            filter("F1", FilterField::From, "vendor", "B"),
            filter("F2", FilterField::Subject, "invoice", "A"),
            filter("F3", FilterField::Subject, "nomatch", "C"),
        ];
        let evals = evaluate(&filters, &make_envelope("Invoice"));
        assert_eq!(select_triggers(&evals), vec!["B", "A"]);
    }

    #[test]
    fn filter_deserializes_with_defaults() {
        let f: Filter = serde_json::from_value(serde_json::json!({
            "id": "f1",
            "field": "subject",
            "regex": "x",
            "director_id": "d1"
        }))
        .unwrap();
        assert!(f.enabled);
        assert!(!f.duplicate_allowed);
        assert_eq!(f.field, FilterField::Subject);
    }
}
