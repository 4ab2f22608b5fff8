//! Translating rule replacement templates into `regex` replacement syntax.
//!
//! Rule files are written with backslash group references (`\1`,
//! `\g<name>`), the style common to sed-like tools. The `regex` crate wants
//! `${1}` and treats a bare `$` as a reference, so templates are rewritten
//! once per rule before use.

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown group reference {0}")]
    UnknownGroup(String),

    #[error("malformed group reference at byte {0}")]
    Malformed(usize),
}

/// Rewrite `template` for use with `regex`.
///
/// - `\N` (one or two digits) and `\g<N>` become group `N`
/// - `\g<name>` becomes the named group
/// - `\\` becomes a single backslash
/// - any other backslash is kept as written
/// - `$` is literal
///
/// A reference to a group `regex` does not have is an error.
pub fn sanitize(template: &str, regex: &Regex) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.char_indices().peekable();

    while let Some((at, c)) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().map(|&(_, next)| next) {
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                Some(d) if d.is_ascii_digit() => {
                    let mut digits = String::new();
                    while digits.len() < 2 {
                        match chars.peek() {
                            Some(&(_, d)) if d.is_ascii_digit() => {
                                digits.push(d);
                                chars.next();
                            }
                            _ => break,
                        }
                    }
                    push_group(&mut out, &digits, regex)?;
                }
                Some('g') => {
                    let rest = &template[at + 2..];
                    if !rest.starts_with('<') {
                        out.push('\\');
                        continue;
                    }
                    let close = rest.find('>').ok_or(TemplateError::Malformed(at))?;
                    let name = &rest[1..close];
                    if name.is_empty() {
                        return Err(TemplateError::Malformed(at));
                    }
                    push_group(&mut out, name, regex)?;
                    // Skip `g<name>`; the closing `>` sits at at + 2 + close.
                    while chars.next_if(|&(i, _)| i <= at + 2 + close).is_some() {}
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }

    Ok(out)
}

fn push_group(out: &mut String, reference: &str, regex: &Regex) -> Result<(), TemplateError> {
    let exists = match reference.parse::<usize>() {
        Ok(index) => index < regex.captures_len(),
        Err(_) => regex.capture_names().flatten().any(|name| name == reference),
    };
    if !exists {
        return Err(TemplateError::UnknownGroup(reference.to_string()));
    }
    out.push_str("${");
    out.push_str(reference);
    out.push('}');
    Ok(())
}
