//! Guarding array reads that PHP 8 reports as undefined keys.
//!
//! `Undefined array key "id"` (PHP 8) and `Undefined index: id` (PHP 7) are
//! warnings about reads like `$row['id']`. Each unguarded read of a reported
//! key becomes `($row['id'] ?? null)`, which keeps the old null result
//! without the warning.

use crate::edit::{apply_edits, Edit};
use crate::locate::decode_entities;
use crate::scan::{kind_at, lex, mask_spans, SpanKind};
use regex::Regex;
use std::sync::OnceLock;

/// Result of a coalescing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalesced {
    pub text: String,
    /// `(key, reads wrapped)` for each key that changed something
    pub wrapped: Vec<(String, usize)>,
}

impl Coalesced {
    pub fn changed(&self) -> bool {
        !self.wrapped.is_empty()
    }

    pub fn note(&self) -> String {
        self.wrapped
            .iter()
            .map(|(key, count)| format!("coalesce:{key} x{count}"))
            .collect::<Vec<_>>()
            .join(" ; ")
    }
}

cached_regex!(
    undefined_key_pattern,
    r#"(?i)undefined\s+(?:array\s+key\s+(?:"([^"\r\n]+)"|'([^'\r\n]+)')|index:\s*([A-Za-z0-9_.\-]+))"#
);

/// String keys the evidence reports as undefined, first-seen order.
pub fn undefined_keys(evidence: &str) -> Vec<String> {
    let text = decode_entities(evidence);
    let mut keys: Vec<String> = Vec::new();
    for caps in undefined_key_pattern().captures_iter(&text) {
        let Some(key) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let key = key.as_str().to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Wrap unguarded reads of the keys named in `evidence`.
pub fn coalesce_undefined_keys(text: &str, evidence: &str) -> Coalesced {
    coalesce_keys(text, &undefined_keys(evidence))
}

/// Wrap unguarded reads of `keys`. Running it on its own output changes
/// nothing, since wrapped reads are followed by `??`.
pub fn coalesce_keys(text: &str, keys: &[String]) -> Coalesced {
    let unchanged = || Coalesced {
        text: text.to_string(),
        wrapped: Vec::new(),
    };
    if keys.is_empty() {
        return unchanged();
    }

    let spans = lex(text);
    let mask = mask_spans(text, &spans);
    let mut edits = Vec::new();
    let mut wrapped = Vec::new();

    for key in keys {
        let quoted = regex::escape(key);
        // The operand includes a `Class::` or `$obj::` scope and extra `$`s
        // of a variable variable, so the wrap encloses the whole read.
        let pattern = format!(
            r#"(?:(?:\\?[A-Za-z_][A-Za-z0-9_\\]*|\$[A-Za-z_][A-Za-z0-9_]*)\s*::\s*|\$+)?\$[A-Za-z_][A-Za-z0-9_]*(?:->[A-Za-z_][A-Za-z0-9_]*)*\[\s*(?:'{quoted}'|"{quoted}")\s*\]"#
        );
        let Ok(access) = Regex::new(&pattern) else {
            continue;
        };

        let mut count = 0;
        for m in access.find_iter(text) {
            if kind_at(&spans, m.start()) != Some(SpanKind::Code) {
                continue;
            }
            if !is_plain_read(text, &mask, m.start(), m.end()) {
                continue;
            }
            edits.push(Edit::new(
                m.start(),
                m.end(),
                format!("({} ?? null)", m.as_str()),
                m.as_str(),
            ));
            count += 1;
        }
        if count > 0 {
            tracing::debug!(key = %key, count, "coalescing array reads");
            wrapped.push((key.clone(), count));
        }
    }

    if edits.is_empty() {
        return unchanged();
    }
    match apply_edits(text, edits) {
        Ok(new_text) => Coalesced {
            text: new_text,
            wrapped,
        },
        Err(err) => {
            // Two keys can match the same read only if they are equal.
            tracing::warn!("dropping coalesce edits: {err}");
            unchanged()
        }
    }
}

const WRITE_SUFFIXES: &[&str] = &[
    "??", "[", "->", "++", "--", "**=", "<<=", ">>=", ".=", "+=", "-=", "*=", "/=", "%=", "|=",
    "&=", "^=",
];

/// A read that is not guarded, not written to and not taken by reference.
fn is_plain_read(text: &str, mask: &str, start: usize, end: usize) -> bool {
    let after = text[end..].trim_start();
    if WRITE_SUFFIXES.iter().any(|s| after.starts_with(s)) {
        return false;
    }
    if after.starts_with('=') && !after.starts_with("==") && !after.starts_with("=>") {
        return false;
    }

    let before = mask[..start].trim_end();
    if before.ends_with("++") || before.ends_with("--") {
        return false;
    }
    // `$obj->$name['k']`, or a scope split off by a comment: the match is
    // only part of the operand.
    if before.ends_with("->") || before.ends_with("::") || before.ends_with('$') || before.ends_with('\\') {
        return false;
    }
    if before.ends_with('&') && !before.ends_with("&&") {
        return false;
    }

    !inside_guard_call(mask, start)
}

/// Whether the nearest unclosed `(` before `offset` (within the statement)
/// belongs to `isset`, `empty` or `unset`.
fn inside_guard_call(mask: &str, offset: usize) -> bool {
    let bytes = mask.as_bytes();
    let mut depth = 0usize;
    for i in (0..offset).rev() {
        match bytes[i] {
            b')' => depth += 1,
            b'(' if depth > 0 => depth -= 1,
            b'(' => {
                let word: String = mask[..i]
                    .trim_end()
                    .chars()
                    .rev()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .collect();
                let word: String = word.chars().rev().collect();
                return ["isset", "empty", "unset"]
                    .iter()
                    .any(|guard| word.eq_ignore_ascii_case(guard));
            }
            b';' | b'{' | b'}' => return false,
            _ => {}
        }
    }
    false
}
