//! Structural scanning of PHP-family source without a full parser.
//!
//! [`lexer`] classifies bytes with an explicit mode machine; [`class`] uses
//! that classification to find class bodies whose braces are real code.
//! [`mask_code`] produces a same-length copy of the source in which only code
//! survives, so plain regexes can run over it and their offsets stay valid in
//! the original text.

pub mod class;
pub mod lexer;

pub use class::{class_regions, class_regions_with, ClassRegion};
pub use lexer::{lex, Span, SpanKind};

/// Blank out every non-code byte (newlines are kept so line numbers and
/// line-anchored patterns still line up).
pub fn mask_code(source: &str) -> String {
    mask_spans(source, &lex(source))
}

/// [`mask_code`] over a precomputed span list.
pub fn mask_spans(source: &str, spans: &[Span]) -> String {
    let mut bytes = source.as_bytes().to_vec();
    for span in spans.iter().filter(|span| !span.kind.is_code()) {
        for b in &mut bytes[span.start..span.end] {
            if *b != b'\n' && *b != b'\r' {
                *b = b' ';
            }
        }
    }
    // Whole spans are blanked and span edges sit on ASCII delimiters, so no
    // multi-byte sequence is ever cut in half.
    match String::from_utf8(bytes) {
        Ok(masked) => masked,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

/// Kind of the span containing `offset`, if any.
pub fn kind_at(spans: &[Span], offset: usize) -> Option<SpanKind> {
    let idx = spans.partition_point(|span| span.end <= offset);
    spans
        .get(idx)
        .filter(|span| span.start <= offset)
        .map(|span| span.kind)
}
