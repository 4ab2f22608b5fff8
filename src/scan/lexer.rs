//! Lexical mode machine for PHP-family source.
//!
//! One left-to-right pass classifies every byte of a file as code or as part of
//! an opaque span (string literal, comment, heredoc body, inline markup). The
//! machine is an explicit [`Mode`] enum with a single transition function,
//! [`step`], that looks at most one delimiter ahead of the cursor.
//!
//! All delimiters are ASCII, so span boundaries always fall on UTF-8 character
//! boundaries and can be used to slice the original `&str`.

/// Classification of a contiguous byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// Markup outside `<?php ... ?>`
    InlineHtml,
    /// PHP code
    Code,
    /// `'...'`
    SingleQuoted,
    /// `"..."`
    DoubleQuoted,
    /// `// ...` or `# ...` up to (not including) the newline
    LineComment,
    /// `/* ... */`, including doc comments
    BlockComment,
    /// `<<<TAG ... TAG` (heredoc and nowdoc)
    Heredoc,
}

impl SpanKind {
    pub fn is_code(self) -> bool {
        matches!(self, SpanKind::Code)
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            SpanKind::SingleQuoted | SpanKind::DoubleQuoted | SpanKind::Heredoc
        )
    }

    pub fn is_comment(self) -> bool {
        matches!(self, SpanKind::LineComment | SpanKind::BlockComment)
    }
}

/// A classified byte range `[start, end)` of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub kind: SpanKind,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    InlineHtml,
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
    Heredoc { tag: String },
}

impl Mode {
    fn kind(&self) -> SpanKind {
        match self {
            Mode::InlineHtml => SpanKind::InlineHtml,
            Mode::Code => SpanKind::Code,
            Mode::SingleQuoted => SpanKind::SingleQuoted,
            Mode::DoubleQuoted => SpanKind::DoubleQuoted,
            Mode::LineComment => SpanKind::LineComment,
            Mode::BlockComment => SpanKind::BlockComment,
            Mode::Heredoc { .. } => SpanKind::Heredoc,
        }
    }
}

/// What the machine does at the cursor.
#[derive(Debug, PartialEq, Eq)]
enum Transition {
    /// Stay in the current mode, move forward this many bytes.
    Advance(usize),
    /// End the current span at the cursor and enter a new mode; the delimiter
    /// (`len` bytes) belongs to the new span.
    Open(Mode, usize),
    /// Consume `len` more bytes into the current span, end it, continue in
    /// the given mode.
    Close(Mode, usize),
}

/// Split `source` into classified spans covering every byte exactly once.
///
/// Text containing an open tag (`<?`) starts as inline markup; anything else
/// (fragments, template partials) is code from the first byte. Unterminated
/// strings or comments simply run to the end of the input.
pub fn lex(source: &str) -> Vec<Span> {
    let bytes = source.as_bytes();
    let mut mode = if source.contains("<?") {
        Mode::InlineHtml
    } else {
        Mode::Code
    };

    let mut spans: Vec<Span> = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match step(&mode, bytes, i) {
            Transition::Advance(n) => i += n.max(1),
            Transition::Open(next, len) => {
                push_span(&mut spans, mode.kind(), start, i);
                start = i;
                mode = next;
                i += len;
            }
            Transition::Close(next, len) => {
                i += len;
                push_span(&mut spans, mode.kind(), start, i.min(bytes.len()));
                start = i.min(bytes.len());
                mode = next;
            }
        }
    }
    push_span(&mut spans, mode.kind(), start, bytes.len());

    spans
}

fn push_span(spans: &mut Vec<Span>, kind: SpanKind, start: usize, end: usize) {
    if start >= end {
        return;
    }
    if let Some(last) = spans.last_mut() {
        if last.kind == kind && last.end == start {
            last.end = end;
            return;
        }
    }
    spans.push(Span { kind, start, end });
}

/// The transition table.
fn step(mode: &Mode, bytes: &[u8], i: usize) -> Transition {
    let at = |offset: usize| bytes.get(i + offset).copied();

    match mode {
        Mode::InlineHtml => match open_tag_len(bytes, i) {
            Some(len) => Transition::Open(Mode::Code, len),
            None => Transition::Advance(1),
        },

        Mode::Code => match (bytes[i], at(1)) {
            (b'\'', _) => Transition::Open(Mode::SingleQuoted, 1),
            (b'"', _) => Transition::Open(Mode::DoubleQuoted, 1),
            (b'/', Some(b'/')) => Transition::Open(Mode::LineComment, 2),
            (b'/', Some(b'*')) => Transition::Open(Mode::BlockComment, 2),
            // `#[` is a PHP 8 attribute, not a comment
            (b'#', Some(b'[')) => Transition::Advance(2),
            (b'#', _) => Transition::Open(Mode::LineComment, 1),
            (b'?', Some(b'>')) => Transition::Close(Mode::InlineHtml, 2),
            (b'<', Some(b'<')) => match heredoc_header(bytes, i) {
                Some((tag, len)) => Transition::Open(Mode::Heredoc { tag }, len),
                None => Transition::Advance(2),
            },
            _ => Transition::Advance(1),
        },

        Mode::SingleQuoted => match bytes[i] {
            b'\\' => Transition::Advance(2),
            b'\'' => Transition::Close(Mode::Code, 1),
            _ => Transition::Advance(1),
        },

        Mode::DoubleQuoted => match bytes[i] {
            b'\\' => Transition::Advance(2),
            b'"' => Transition::Close(Mode::Code, 1),
            _ => Transition::Advance(1),
        },

        Mode::LineComment => match (bytes[i], at(1)) {
            (b'\n', _) | (b'\r', Some(b'\n')) => Transition::Close(Mode::Code, 0),
            (b'?', Some(b'>')) => Transition::Close(Mode::Code, 0),
            _ => Transition::Advance(1),
        },

        Mode::BlockComment => match (bytes[i], at(1)) {
            (b'*', Some(b'/')) => Transition::Close(Mode::Code, 2),
            _ => Transition::Advance(1),
        },

        Mode::Heredoc { tag } => {
            let line_start = i == 0 || bytes[i - 1] == b'\n';
            if line_start {
                if let Some(len) = heredoc_terminator_len(bytes, i, tag) {
                    return Transition::Close(Mode::Code, len);
                }
            }
            match bytes[i..].iter().position(|&b| b == b'\n') {
                Some(pos) => Transition::Advance(pos + 1),
                None => Transition::Advance(bytes.len() - i),
            }
        }
    }
}

/// Length of a PHP open tag at `i`: `<?php`, `<?=`, or a bare `<?` followed by
/// whitespace. `<?xml` and friends are markup.
fn open_tag_len(bytes: &[u8], i: usize) -> Option<usize> {
    let rest = &bytes[i..];
    if !rest.starts_with(b"<?") {
        return None;
    }
    if rest.len() >= 5 && rest[2..5].eq_ignore_ascii_case(b"php") {
        return Some(5);
    }
    match rest.get(2) {
        Some(b'=') => Some(3),
        Some(b) if b.is_ascii_whitespace() => Some(2),
        None => Some(2),
        _ => None,
    }
}

/// Parse `<<<TAG`, `<<<'TAG'` or `<<<"TAG"` plus its line ending at `i`.
///
/// Returns the tag and the header length including the newline.
fn heredoc_header(bytes: &[u8], i: usize) -> Option<(String, usize)> {
    let rest = &bytes[i..];
    if !rest.starts_with(b"<<<") {
        return None;
    }
    let mut j = 3;
    while matches!(rest.get(j), Some(b' ') | Some(b'\t')) {
        j += 1;
    }

    let quote = match rest.get(j) {
        Some(&q @ (b'\'' | b'"')) => {
            j += 1;
            Some(q)
        }
        _ => None,
    };

    let tag_start = j;
    match rest.get(j) {
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => {}
        _ => return None,
    }
    while rest
        .get(j)
        .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
    {
        j += 1;
    }
    let tag = std::str::from_utf8(&rest[tag_start..j]).ok()?.to_string();

    if let Some(q) = quote {
        if rest.get(j) != Some(&q) {
            return None;
        }
        j += 1;
    }

    match (rest.get(j), rest.get(j + 1)) {
        (Some(b'\n'), _) => Some((tag, j + 1)),
        (Some(b'\r'), Some(b'\n')) => Some((tag, j + 2)),
        _ => None,
    }
}

/// If the line starting at `i` closes the heredoc, the byte length of its
/// indentation plus tag. The tag must not run on into an identifier.
fn heredoc_terminator_len(bytes: &[u8], i: usize, tag: &str) -> Option<usize> {
    let rest = &bytes[i..];
    let indent = rest
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\t'))
        .count();
    let after_indent = &rest[indent..];
    if !after_indent.starts_with(tag.as_bytes()) {
        return None;
    }
    match after_indent.get(tag.len()) {
        Some(b) if b.is_ascii_alphanumeric() || *b == b'_' => None,
        _ => Some(indent + tag.len()),
    }
}
