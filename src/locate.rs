//! Extracting `(file, line)` targets from captured PHP error output.
//!
//! PHP prints diagnostics as `... in <b>/path/file.php</b> on line <b>12</b>`
//! when `html_errors` is on and as `... in /path/file.php on line 12`
//! otherwise. Both shapes are recognized, including entity-escaped markup
//! copied out of a page source view.

use crate::remap::{normalize_path, to_local, PathMap};
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One `(file, line)` pair named by the evidence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ErrorTarget {
    /// Path exactly as printed (trimmed)
    pub path: String,
    pub line: u32,
}

impl ErrorTarget {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }

    /// Local path for this target: remapped, then joined onto `root` when
    /// still relative.
    pub fn resolve(&self, root: &Path, map: &PathMap) -> PathBuf {
        let mapped = map.remap(&self.path);
        if mapped.is_absolute() {
            mapped
        } else {
            normalize_path(&root.join(mapped))
        }
    }

    fn dedup_key(&self) -> (PathBuf, u32) {
        (normalize_path(Path::new(&to_local(&self.path))), self.line)
    }
}

cached_regex!(
    markup_pattern,
    r"(?i)\bin(?:\s+|\s*<[^>]*>)(?:\s*<[^>]*>)*\s*([^<>\r\n]+?\.(?:php|phtml|tpl|inc))\s*(?:<[^>]*>\s*)*on\s*(?:<[^>]*>\s*)*line\s*(?:<[^>]*>\s*)*(\d+)"
);

cached_regex!(
    plain_pattern,
    r#"(?i)\b(?:in|at)\s+((?:/|[A-Za-z]:[\\/])[^\s:<>"']+?\.(?:php|phtml|tpl|inc))\s+on\s+(?:<[^>]*>\s*)*line\s+(?:<[^>]*>\s*)*(\d+)"#
);

/// All targets named by `evidence`, deduplicated by normalized path and
/// line, in the order they appear.
pub fn extract_targets(evidence: &str) -> Vec<ErrorTarget> {
    if evidence.trim().is_empty() {
        return Vec::new();
    }
    let text = decode_entities(evidence);

    let mut found: Vec<(usize, ErrorTarget)> = Vec::new();
    for caps in markup_pattern().captures_iter(&text) {
        let (Some(path), Some(line)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        // Without a tag in front, a path containing spaces is more likely
        // prose ("in the file x.php") than a path.
        let tagged = text[..path.start()].trim_end().ends_with('>');
        if !tagged && path.as_str().trim().contains(char::is_whitespace) {
            continue;
        }
        if let Some(target) = to_target(path.as_str(), line.as_str()) {
            found.push((path.start(), target));
        }
    }
    for caps in plain_pattern().captures_iter(&text) {
        let (Some(path), Some(line)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if let Some(target) = to_target(path.as_str(), line.as_str()) {
            found.push((path.start(), target));
        }
    }
    found.sort_by_key(|(offset, _)| *offset);

    let mut seen = HashSet::new();
    let targets: Vec<ErrorTarget> = found
        .into_iter()
        .map(|(_, target)| target)
        .filter(|target| seen.insert(target.dedup_key()))
        .collect();
    tracing::debug!(count = targets.len(), "extracted targets");
    targets
}

fn to_target(path: &str, line: &str) -> Option<ErrorTarget> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let line = line.parse::<u32>().ok()?;
    Some(ErrorTarget::new(path, line))
}

/// Decode the handful of HTML entities that show up in escaped error output.
/// Unknown entities are left as written.
pub fn decode_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        match candidate
            .get(..candidate.len().min(12))
            .and_then(|head| head.find(';'))
            .and_then(|semi| decode_entity(&candidate[1..semi]).map(|c| (c, semi)))
        {
            Some((decoded, semi)) => {
                out.push(decoded);
                rest = &candidate[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "quot" => Some('"'),
        "apos" => Some('\''),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "nbsp" => Some(' '),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}
