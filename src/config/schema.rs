use crate::remap::{PathMap, PathMapping};
use crate::rules::Rule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Rule set and path mappings, as written in a config file.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct FixerConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub path_maps: Vec<PathMapping>,
}

impl FixerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for rule in &self.rules {
            let rule_id = (!rule.id.trim().is_empty()).then(|| rule.id.clone());
            if rule_id.is_none() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: None,
                    field: "id",
                });
            }
            if rule.search.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: rule_id.clone(),
                    field: "search",
                });
            }
            if let Some(id) = rule_id {
                if !seen.insert(id.clone()) {
                    issues.push(ValidationIssue::DuplicateRuleId { rule_id: id });
                }
            }
        }

        for (index, mapping) in self.path_maps.iter().enumerate() {
            if mapping.from.trim().is_empty() {
                issues.push(ValidationIssue::EmptyPathMapping { index, field: "from" });
            }
            if mapping.to.trim().is_empty() {
                issues.push(ValidationIssue::EmptyPathMapping { index, field: "to" });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Append another config's rules and mappings after this one's.
    pub fn merge(&mut self, other: FixerConfig) {
        self.rules.extend(other.rules);
        self.path_maps.extend(other.path_maps);
    }

    pub fn path_map(&self) -> PathMap {
        PathMap::new(self.path_maps.iter().cloned())
    }

    /// [`FixerConfig::path_map`] plus the mappings in `PATH_MAPS`.
    pub fn path_map_with_env(&self) -> PathMap {
        self.path_map().merged(&PathMap::from_env())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.path_maps.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingField {
        rule_id: Option<String>,
        field: &'static str,
    },
    DuplicateRuleId {
        rule_id: String,
    },
    EmptyPathMapping {
        index: usize,
        field: &'static str,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingField { rule_id, field } => match rule_id {
                Some(id) => write!(f, "rule '{id}' missing required field '{field}'"),
                None => write!(f, "rule missing required field '{field}'"),
            },
            ValidationIssue::DuplicateRuleId { rule_id } => {
                write!(f, "rule id '{rule_id}' is used more than once")
            }
            ValidationIssue::EmptyPathMapping { index, field } => {
                write!(f, "path mapping #{} has an empty '{field}'", index + 1)
            }
        }
    }
}
