//! Ordered search/replace rules.
//!
//! Each rule is a multi-line regex plus a replacement template. Rules apply
//! one after another to the progressively updated text, so a later rule sees
//! what earlier ones produced. A broken rule is reported and skipped; it never
//! stops the rest of the set.

pub mod template;

use crate::cache::get_or_compile_regex;
use serde::{Deserialize, Serialize};

pub use template::{sanitize, TemplateError};

/// One declarative rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Rule {
    pub id: String,
    pub search: String,
    #[serde(default)]
    pub replace: String,
    #[serde(default)]
    pub note: String,
    /// Only run when the evidence contains this text (case-insensitive)
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_evidence: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl Rule {
    pub fn new(id: impl Into<String>, search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            search: search.into(),
            replace: replace.into(),
            note: String::new(),
            match_evidence: None,
            case_insensitive: false,
        }
    }

    #[must_use]
    pub fn matching(mut self, evidence: impl Into<String>) -> Self {
        self.match_evidence = Some(evidence.into());
        self
    }

    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    fn label(&self) -> &str {
        if self.id.trim().is_empty() {
            "rule"
        } else {
            &self.id
        }
    }

    fn applies_to(&self, evidence_lower: &str) -> bool {
        match &self.match_evidence {
            Some(needle) if !needle.is_empty() => evidence_lower.contains(&needle.to_lowercase()),
            _ => true,
        }
    }
}

/// What a rule pass did to one text.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct RuleOutcome {
    pub text: String,
    pub changed: bool,
    /// One entry per rule that matched or failed
    pub notes: Vec<String>,
}

impl RuleOutcome {
    pub fn note(&self) -> String {
        self.notes.join(" ; ")
    }

    /// Whether any rule failed to compile or had an unusable template.
    pub fn has_errors(&self) -> bool {
        self.notes
            .iter()
            .any(|n| n.contains(": bad_regex(") || n.contains(": bad_replace("))
    }
}

/// Apply `rules` in order to `text`.
pub fn apply_rules(rules: &[Rule], text: &str, evidence: &str) -> RuleOutcome {
    let evidence_lower = evidence.to_lowercase();
    let mut current = text.to_string();
    let mut notes = Vec::new();

    for rule in rules {
        if rule.search.is_empty() || !rule.applies_to(&evidence_lower) {
            continue;
        }
        let id = rule.label();

        let regex = match get_or_compile_regex(&rule.search, rule.case_insensitive) {
            Ok(regex) => regex,
            Err(err) => {
                tracing::warn!(rule = id, "rule pattern does not compile: {err}");
                notes.push(format!("{id}: bad_regex({})", short_error(&err.to_string())));
                continue;
            }
        };
        let replacement = match sanitize(&rule.replace, &regex) {
            Ok(replacement) => replacement,
            Err(err) => {
                tracing::warn!(rule = id, "rule template unusable: {err}");
                notes.push(format!("{id}: bad_replace({err})"));
                continue;
            }
        };

        let count = regex.find_iter(&current).count();
        if count == 0 {
            continue;
        }
        current = regex.replace_all(&current, replacement.as_str()).into_owned();
        tracing::debug!(rule = id, count, "rule matched");
        notes.push(format!("{id} x{count}"));
    }

    RuleOutcome {
        changed: current != text,
        text: current,
        notes,
    }
}

/// The `regex` crate renders syntax errors across several lines with a
/// caret diagram; keep only the final message line.
fn short_error(message: &str) -> &str {
    message
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(message)
}
