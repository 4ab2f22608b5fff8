use super::lexer::{lex, Span};
use super::mask_spans;
use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// The brace pair of one class body, as byte offsets into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRegion {
    /// Class name as written
    pub name: String,
    /// Offset of the start of the line holding the `class` keyword
    pub decl_start: usize,
    /// Offset of the body's opening `{`
    pub open_index: usize,
    /// Offset of the body's closing `}`
    pub close_index: usize,
    /// Whether the declaration has an `extends` clause
    pub extends: bool,
}

impl ClassRegion {
    /// Byte range strictly between the braces.
    pub fn body(&self) -> Range<usize> {
        self.open_index + 1..self.close_index
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset > self.open_index && offset < self.close_index
    }
}

cached_regex!(class_keyword, r"(?i)\bclass\s+([A-Za-z_][A-Za-z0-9_]*)");
cached_regex!(extends_keyword, r"(?i)\bextends\b");

/// Find every top-level class body in `source`.
///
/// Braces inside strings, comments, heredocs and inline markup are ignored.
/// A class whose body never closes produces no region.
pub fn class_regions(source: &str) -> Vec<ClassRegion> {
    let spans = lex(source);
    class_regions_with(source, &spans)
}

/// [`class_regions`] over a precomputed span list.
pub fn class_regions_with(source: &str, spans: &[Span]) -> Vec<ClassRegion> {
    let mask = mask_spans(source, spans);
    let bytes = mask.as_bytes();
    let mut regions: Vec<ClassRegion> = Vec::new();
    let mut resume_at = 0;

    for caps in class_keyword().captures_iter(&mask) {
        let (Some(keyword), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if keyword.start() < resume_at {
            continue;
        }
        if !is_declaration_keyword(&mask, keyword.start()) {
            continue;
        }
        let name_text = name.as_str();
        if name_text.eq_ignore_ascii_case("extends") || name_text.eq_ignore_ascii_case("implements")
        {
            continue;
        }

        let Some(open_index) = find_body_open(bytes, name.end()) else {
            continue;
        };
        let Some(close_index) = find_matching_close(bytes, open_index) else {
            // Unterminated body: nothing after this point can be trusted
            // to sit at top level either.
            break;
        };

        let header = &mask[name.end()..open_index];
        let decl_start = mask[..keyword.start()]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);

        regions.push(ClassRegion {
            name: name_text.to_string(),
            decl_start,
            open_index,
            close_index,
            extends: extends_keyword().is_match(header),
        });
        resume_at = close_index + 1;
    }

    regions
}

/// Rejects `::class`, `->class`, `$class` and anonymous `new class`.
fn is_declaration_keyword(mask: &str, keyword_start: usize) -> bool {
    let before = &mask[..keyword_start];
    if before.ends_with('$') {
        return false;
    }
    let trimmed = before.trim_end();
    if trimmed.ends_with("::") || trimmed.ends_with("->") {
        return false;
    }
    let last_word: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    !last_word.eq_ignore_ascii_case("new")
}

/// Scan the declaration header (`extends`/`implements` clauses) for the
/// opening brace. Anything else in the header means this is not a class
/// declaration.
fn find_body_open(bytes: &[u8], from: usize) -> Option<usize> {
    for (offset, &b) in bytes[from..].iter().enumerate() {
        match b {
            b'{' => return Some(from + offset),
            b if b.is_ascii_alphanumeric() => {}
            b'_' | b'\\' | b',' => {}
            b if b.is_ascii_whitespace() => {}
            _ => return None,
        }
    }
    None
}

fn find_matching_close(bytes: &[u8], open_index: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, &b) in bytes[open_index..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open_index + offset);
                }
            }
            _ => {}
        }
    }
    None
}
