//! Formatting conventions inferred from a file's existing text.
//!
//! A [`StyleProfile`] only shapes text the engine inserts or asks a
//! collaborator to generate. It never triggers reformatting of existing lines.

use crate::scan::{lex, mask_spans, Span, SpanKind};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BraceStyle {
    SameLine,
    NextLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStyle {
    Single,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArraySyntax {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CtrlSpacing {
    Spaced,
    Tight,
}

/// Formatting conventions of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StyleProfile {
    /// One indentation level: a tab or a run of spaces
    pub indent: String,
    pub eol: LineEnding,
    pub brace: BraceStyle,
    pub quotes: QuoteStyle,
    pub array_syntax: ArraySyntax,
    /// `$a . $b` rather than `$a.$b`
    pub concat_spaced: bool,
    pub ctrl_spacing: CtrlSpacing,
    /// `<?= $x ?>` preferred over `echo`
    pub short_echo: bool,
}

impl Default for StyleProfile {
    fn default() -> Self {
        Self {
            indent: "    ".to_string(),
            eol: LineEnding::Lf,
            brace: BraceStyle::SameLine,
            quotes: QuoteStyle::Single,
            array_syntax: ArraySyntax::Short,
            concat_spaced: true,
            ctrl_spacing: CtrlSpacing::Spaced,
            short_echo: false,
        }
    }
}

cached_regex!(brace_same_line, r"\)[ \t]*\{");
cached_regex!(brace_next_line, r"\)[ \t]*\r?\n[ \t]*\{");
cached_regex!(array_long, r"(?i)\barray\s*\(");
cached_regex!(array_short, r"(?:[=(,\[]|=>|\breturn)\s*\[");
cached_regex!(concat_spaced, r"[A-Za-z0-9_)\]]\s+\.\s+[$A-Za-z_(]");
cached_regex!(concat_tight, r"[A-Za-z_)\]]\.[$A-Za-z_(]");
cached_regex!(
    ctrl_spaced,
    r"(?i)\b(?:if|elseif|for|foreach|while|switch|catch)\s+\("
);
cached_regex!(
    ctrl_tight,
    r"(?i)\b(?:if|elseif|for|foreach|while|switch|catch)\("
);
cached_regex!(echo_statement, r"(?i)\becho\b");

impl StyleProfile {
    /// Infer a profile from source text. Every field compares two mutually
    /// exclusive counts; ties keep the default.
    pub fn infer(source: &str) -> Self {
        let spans = lex(source);
        Self::infer_with(source, &spans)
    }

    /// [`StyleProfile::infer`] over a precomputed span list.
    pub fn infer_with(source: &str, spans: &[Span]) -> Self {
        let defaults = Self::default();
        let code = mask_spans(source, spans);
        let operands = operand_mask(source, spans);

        let crlf = source.matches("\r\n").count();
        let lf = source.matches('\n').count() - crlf;
        let eol = if crlf > lf {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        };

        let same = brace_same_line().find_iter(&code).count();
        let next = brace_next_line().find_iter(&code).count();
        let brace = if next > same {
            BraceStyle::NextLine
        } else {
            BraceStyle::SameLine
        };

        let single = spans
            .iter()
            .filter(|s| s.kind == SpanKind::SingleQuoted)
            .count();
        let double = spans
            .iter()
            .filter(|s| s.kind == SpanKind::DoubleQuoted)
            .count();
        let quotes = if double > single {
            QuoteStyle::Double
        } else {
            QuoteStyle::Single
        };

        let long = array_long().find_iter(&code).count();
        let short = array_short().find_iter(&code).count();
        let array_syntax = if long > short {
            ArraySyntax::Long
        } else {
            ArraySyntax::Short
        };

        let spaced = concat_spaced().find_iter(&operands).count();
        let tight = concat_tight().find_iter(&operands).count();

        let ctrl_spaced_count = ctrl_spaced().find_iter(&code).count();
        let ctrl_tight_count = ctrl_tight().find_iter(&code).count();
        let ctrl_spacing = if ctrl_tight_count > ctrl_spaced_count {
            CtrlSpacing::Tight
        } else {
            CtrlSpacing::Spaced
        };

        let short_echo_count = code.matches("<?=").count();
        let echo_count = echo_statement().find_iter(&code).count();

        Self {
            indent: infer_indent(&code).unwrap_or(defaults.indent),
            eol,
            brace,
            quotes,
            array_syntax,
            concat_spaced: spaced >= tight,
            ctrl_spacing,
            short_echo: short_echo_count > echo_count,
        }
    }

    /// One-line description handed to the generative fallback.
    pub fn hint(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StyleProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indent = if self.indent == "\t" {
            "tabs".to_string()
        } else {
            format!("{} spaces", self.indent.len())
        };
        write!(
            f,
            "indent: {indent}; line endings: {}; braces: {}; quotes: {}; arrays: {}; \
             concatenation: {}; control keywords: {}; short echo: {}",
            match self.eol {
                LineEnding::Lf => "LF",
                LineEnding::CrLf => "CRLF",
            },
            match self.brace {
                BraceStyle::SameLine => "same line",
                BraceStyle::NextLine => "next line",
            },
            match self.quotes {
                QuoteStyle::Single => "single",
                QuoteStyle::Double => "double",
            },
            match self.array_syntax {
                ArraySyntax::Short => "short []",
                ArraySyntax::Long => "array()",
            },
            if self.concat_spaced { "spaced" } else { "tight" },
            match self.ctrl_spacing {
                CtrlSpacing::Spaced => "spaced `if (`",
                CtrlSpacing::Tight => "tight `if(`",
            },
            if self.short_echo { "yes" } else { "no" },
        )
    }
}

/// Tabs against spaces, then the most common indent step among 2, 3, 4 and 8.
///
/// A step is the growth in leading spaces from one non-blank line to the
/// next, which keeps deeply nested bodies from outvoting the first level.
fn infer_indent(code: &str) -> Option<String> {
    let mut tab_lines = 0usize;
    let mut space_lines = 0usize;
    let mut steps = [0usize; 9];
    let mut previous: Option<usize> = None;

    for line in code.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('\t') {
            tab_lines += 1;
        } else if line.starts_with(' ') {
            space_lines += 1;
        }
        let run = line.bytes().take_while(|&b| b == b' ').count();
        if let Some(prev) = previous {
            if run > prev {
                let step = run - prev;
                if matches!(step, 2 | 3 | 4 | 8) {
                    steps[step] += 1;
                }
            }
        }
        previous = Some(run);
    }

    if tab_lines > space_lines {
        return Some("\t".to_string());
    }

    // Ties resolve toward 4, then the narrower width.
    let best = [4usize, 2, 3, 8]
        .into_iter()
        .filter(|&w| steps[w] > 0)
        .fold(None::<usize>, |best, w| match best {
            Some(b) if steps[b] >= steps[w] => Some(b),
            _ => Some(w),
        })?;
    Some(" ".repeat(best))
}

/// Code with string literals replaced by identifier-like filler and
/// everything else opaque blanked, so concatenation operators next to string
/// operands stay visible without string contents leaking in.
fn operand_mask(source: &str, spans: &[Span]) -> String {
    let mut bytes = source.as_bytes().to_vec();
    for span in spans.iter().filter(|span| !span.kind.is_code()) {
        let fill = if span.kind.is_string() { b'S' } else { b' ' };
        for b in &mut bytes[span.start..span.end] {
            if *b != b'\n' && *b != b'\r' {
                *b = fill;
            }
        }
    }
    match String::from_utf8(bytes) {
        Ok(masked) => masked,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}
