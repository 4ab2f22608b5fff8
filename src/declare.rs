//! Declaring properties that classes create dynamically.
//!
//! PHP 8.2 deprecates assigning `$this->name` when `name` is not declared.
//! For every class region the declarator compares the names referenced
//! through `$this->` in code with the names declared at the top level of the
//! body, then inserts the missing declarations in the file's own style.

use crate::edit::{apply_edits, Edit};
use crate::scan::{class_regions_with, lex, mask_spans, ClassRegion, Span, SpanKind};
use crate::style::StyleProfile;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const ALLOW_ATTRIBUTE: &str = "#[\\AllowDynamicProperties]";

/// What to do about undeclared dynamic properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DynPropsMode {
    /// Insert property declarations
    #[default]
    Declare,
    /// Mark the class with `#[\AllowDynamicProperties]`
    Attribute,
    /// Leave classes alone
    Off,
}

impl fmt::Display for DynPropsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DynPropsMode::Declare => "declare",
            DynPropsMode::Attribute => "attribute",
            DynPropsMode::Off => "off",
        };
        f.write_str(s)
    }
}

impl FromStr for DynPropsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "declare" => Ok(DynPropsMode::Declare),
            "attribute" => Ok(DynPropsMode::Attribute),
            "off" => Ok(DynPropsMode::Off),
            other => Err(format!(
                "unknown dynamic property mode '{other}' (expected declare, attribute or off)"
            )),
        }
    }
}

/// Keyword used for inserted declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclStyle {
    Var,
    Public,
    Protected,
    Private,
}

impl DeclStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            DeclStyle::Var => "var",
            DeclStyle::Public => "public",
            DeclStyle::Protected => "protected",
            DeclStyle::Private => "private",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "var" => Some(DeclStyle::Var),
            "public" => Some(DeclStyle::Public),
            "protected" => Some(DeclStyle::Protected),
            "private" => Some(DeclStyle::Private),
            _ => None,
        }
    }

    /// Whether a subclass can see a property declared this way.
    fn is_inherited(self) -> bool {
        !matches!(self, DeclStyle::Private)
    }

    /// The file's most used declaration keyword. Ties prefer `public`, then
    /// `var`, `protected`, `private`.
    pub fn dominant(source_mask: &str) -> Self {
        let mut counts: HashMap<DeclStyle, usize> = HashMap::new();
        for caps in dominance_pattern().captures_iter(source_mask) {
            if let Some(style) = caps.get(1).and_then(|m| DeclStyle::from_keyword(m.as_str())) {
                *counts.entry(style).or_default() += 1;
            }
        }

        let mut best = DeclStyle::Public;
        for style in [DeclStyle::Public, DeclStyle::Var, DeclStyle::Protected, DeclStyle::Private] {
            let count = counts.get(&style).copied().unwrap_or(0);
            if count > counts.get(&best).copied().unwrap_or(0) {
                best = style;
            }
        }
        best
    }
}

/// Result of a declarator pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declared {
    pub text: String,
    /// `Class::$name` for each declaration, or the class name for each
    /// attribute added
    pub added: Vec<String>,
}

impl Declared {
    fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_string(),
            added: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

cached_regex!(
    declaration_pattern,
    r"(?i)\b(var|public|protected|private)\b(?:\s+(?:static|readonly)\b)*(?:\s+\??[A-Za-z_\\][A-Za-z0-9_\\|]*)?\s+&?\$([A-Za-z_][A-Za-z0-9_]*)"
);
cached_regex!(
    dominance_pattern,
    r"(?im)^[ \t]*(?:(?:static|readonly)\s+)*(var|public|protected|private)\b(?:\s+(?:static|readonly)\b)*(?:\s+\??[A-Za-z_\\][A-Za-z0-9_\\|]*)?\s+\$"
);
cached_regex!(extra_name_pattern, r",\s*&?\$([A-Za-z_][A-Za-z0-9_]*)");
cached_regex!(this_reference_pattern, r"\$this\s*->\s*([A-Za-z_][A-Za-z0-9_]*)");
cached_regex!(function_pattern, r"(?i)\bfunction\b");
cached_regex!(setter_pattern, r"(?i)\bfunction\s+&?__set\s*\(");
cached_regex!(parent_pattern, r"(?i)\bextends\s+\\?([A-Za-z_][A-Za-z0-9_\\]*)");
cached_regex!(
    class_keyword_pattern,
    r"(?i)\b(?:(?:abstract|final|readonly)\s+)*class\b"
);

/// What one class body declares and references.
struct ClassFacts {
    region: ClassRegion,
    declared: BTreeSet<String>,
    /// Declared names a subclass can see
    inheritable: BTreeSet<String>,
    referenced: BTreeSet<String>,
    /// Offset just past the last top-level declaration statement
    last_decl_end: Option<usize>,
    has_setter: bool,
    parent: Option<String>,
}

struct Analysis<'a> {
    text: &'a str,
    spans: Vec<Span>,
    mask: String,
    classes: Vec<ClassFacts>,
}

impl<'a> Analysis<'a> {
    fn new(text: &'a str) -> Self {
        let spans = lex(text);
        let mask = mask_spans(text, &spans);
        let classes = class_regions_with(text, &spans)
            .into_iter()
            .map(|region| class_facts(&mask, region))
            .collect();
        Self {
            text,
            spans,
            mask,
            classes,
        }
    }

    /// Referenced names with no declaration in the class or a visible
    /// declaration in a same-file ancestor.
    fn missing(&self, facts: &ClassFacts) -> BTreeSet<String> {
        if facts.has_setter {
            return BTreeSet::new();
        }
        let mut missing: BTreeSet<String> =
            facts.referenced.difference(&facts.declared).cloned().collect();

        let mut parent = facts.parent.clone();
        // Bounded walk; a cycle is invalid PHP anyway.
        for _ in 0..self.classes.len() {
            let Some(name) = parent.take() else { break };
            let Some(ancestor) = self
                .classes
                .iter()
                .find(|c| c.region.name.eq_ignore_ascii_case(&name))
            else {
                break;
            };
            missing.retain(|n| !ancestor.inheritable.contains(n));
            parent = ancestor.parent.clone();
        }
        missing
    }
}

fn class_facts(mask: &str, region: ClassRegion) -> ClassFacts {
    let body = region.body();
    let top = top_level(&mask[body.clone()]);

    let mut declared = BTreeSet::new();
    let mut inheritable = BTreeSet::new();
    let mut last_decl_end = None;
    let mut paren_depth = 0i32;
    let mut cursor = 0;

    for caps in declaration_pattern().captures_iter(&top) {
        let (Some(whole), Some(keyword), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        paren_depth += paren_delta(&top.as_bytes()[cursor..whole.start()]);
        cursor = whole.start();

        let style = DeclStyle::from_keyword(keyword.as_str()).unwrap_or(DeclStyle::Public);
        let mut names = vec![name.as_str().to_string()];

        // Promoted constructor parameters sit inside parentheses and are
        // single declarations; only real statements can list more names.
        if paren_depth == 0 {
            let end = statement_end(top.as_bytes(), whole.end()).unwrap_or(whole.end());
            names.extend(
                extra_name_pattern()
                    .captures_iter(&top[whole.end()..end])
                    .filter_map(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            );
            last_decl_end = Some(body.start + end);
        }

        for name in names {
            if style.is_inherited() {
                inheritable.insert(name.clone());
            }
            declared.insert(name);
        }
    }

    let body_code = &mask[body.clone()];
    let referenced = this_reference_pattern()
        .captures_iter(body_code)
        .filter_map(|caps| {
            let name = caps.get(1)?;
            let next = body_code[name.end()..].trim_start().chars().next();
            (next != Some('(')).then(|| name.as_str().to_string())
        })
        .collect();

    let header = &mask[region.decl_start..region.open_index];
    let parent = parent_pattern()
        .captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| {
            let qualified = m.as_str();
            qualified.rsplit('\\').next().unwrap_or(qualified).to_string()
        });

    ClassFacts {
        has_setter: setter_pattern().is_match(&top),
        region,
        declared,
        inheritable,
        referenced,
        last_decl_end,
        parent,
    }
}

/// Blank everything nested inside braces, leaving the body's own level.
fn top_level(body_mask: &str) -> String {
    let mut depth = 0usize;
    let bytes: Vec<u8> = body_mask
        .bytes()
        .map(|b| {
            let nested = match b {
                b'{' => {
                    depth += 1;
                    true
                }
                b'}' => {
                    let was = depth;
                    depth = depth.saturating_sub(1);
                    was > 0
                }
                _ => depth > 0,
            };
            if nested && b != b'\n' && b != b'\r' {
                b' '
            } else {
                b
            }
        })
        .collect();
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

fn paren_delta(bytes: &[u8]) -> i32 {
    bytes.iter().fold(0, |acc, b| match b {
        b'(' => acc + 1,
        b')' => acc - 1,
        _ => acc,
    })
}

/// Offset just past the `;` ending the statement that starts before `from`.
fn statement_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate().skip(from) {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b';' if depth <= 0 => return Some(i + 1),
            _ => {}
        }
    }
    None
}

fn line_start(text: &str, offset: usize) -> usize {
    text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

fn leading_whitespace(text: &str, from: usize) -> &str {
    let line = &text[from..];
    let end = line
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(line.len());
    &line[..end]
}

/// Start of the line after `offset`, or `offset` itself (mid-line) when the
/// region closes first.
fn after_line(text: &str, offset: usize, limit: usize) -> (usize, bool) {
    match text[offset..limit].find('\n') {
        Some(nl) => (offset + nl + 1, false),
        None => (offset, true),
    }
}

/// Start of `offset`'s line when that line lies inside the body, else
/// `offset` itself (mid-line).
fn before_line(text: &str, region: &ClassRegion, offset: usize) -> (usize, bool) {
    let start = line_start(text, offset);
    if start > region.open_index {
        (start, false)
    } else {
        (offset, true)
    }
}

fn insertion_point(analysis: &Analysis<'_>, facts: &ClassFacts) -> (usize, bool) {
    let text = analysis.text;
    let region = &facts.region;
    let body = region.body();

    if let Some(end) = facts.last_decl_end {
        // Code after the `;` on the same line (`public $a; function f() {`)
        // keeps the insertion right behind the statement.
        let rest = &analysis.mask[end..region.close_index];
        let rest_of_line = rest.find('\n').map_or(rest, |nl| &rest[..nl]);
        if !rest_of_line.trim().is_empty() {
            return (end, true);
        }
        return after_line(text, end, region.close_index);
    }

    let top = top_level(&analysis.mask[body.clone()]);
    if let Some(method) = function_pattern().find(&top) {
        let method_at = body.start + method.start();
        let method_line = line_start(text, method_at).max(body.start);

        let doc = analysis.spans.iter().find(|span| {
            span.kind == SpanKind::BlockComment
                && span.start >= body.start
                && span.end <= method_at
                && span.text(text).starts_with("/**")
                && paren_free_depth(&analysis.mask[body.start..span.start]) == 0
        });
        if let Some(doc) = doc {
            let between = &text[doc.end.min(method_line)..method_line];
            return if is_attached(between) {
                before_line(text, region, doc.start)
            } else {
                after_line(text, doc.end, region.close_index)
            };
        }
    }

    // Body start, past the rest of the `{` line when it is blank.
    let rest = &text[body.clone()];
    match rest.find('\n') {
        Some(nl) if rest[..nl].trim().is_empty() => (body.start + nl + 1, false),
        _ => (body.start, true),
    }
}

fn paren_free_depth(mask: &str) -> i32 {
    mask.bytes().fold(0, |acc, b| match b {
        b'{' => acc + 1,
        b'}' => acc - 1,
        _ => acc,
    })
}

/// Only blank lines and attributes between a doc block and its method.
fn is_attached(between: &str) -> bool {
    between.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with("#[")
    })
}

/// Dispatch on `mode`.
pub fn fix_dynamic_properties(text: &str, profile: &StyleProfile, mode: DynPropsMode) -> Declared {
    match mode {
        DynPropsMode::Declare => declare_dynamic_properties(text, profile),
        DynPropsMode::Attribute => allow_dynamic_properties(text, profile),
        DynPropsMode::Off => Declared::unchanged(text),
    }
}

/// Insert a declaration for every property a class uses without declaring.
///
/// Running it on its own output changes nothing.
pub fn declare_dynamic_properties(text: &str, profile: &StyleProfile) -> Declared {
    let analysis = Analysis::new(text);
    if analysis.classes.is_empty() {
        return Declared::unchanged(text);
    }

    let dominant = DeclStyle::dominant(&analysis.mask);
    let eol = profile.eol.as_str();
    let mut edits = Vec::new();
    let mut added = Vec::new();

    for facts in analysis.classes.iter().rev() {
        let missing = analysis.missing(facts);
        if missing.is_empty() {
            continue;
        }

        let style = match dominant {
            DeclStyle::Protected | DeclStyle::Private if facts.region.extends => DeclStyle::Public,
            other => other,
        };
        let class_indent = leading_whitespace(text, facts.region.decl_start);
        let (at, mid_line) = insertion_point(&analysis, facts);

        let mut block = String::new();
        if mid_line {
            block.push_str(eol);
        }
        for name in &missing {
            block.push_str(&format!(
                "{class_indent}{}{} ${name};{eol}",
                profile.indent,
                style.as_str()
            ));
            added.push(format!("{}::${name}", facts.region.name));
        }
        tracing::debug!(class = %facts.region.name, count = missing.len(), "declaring properties");
        edits.push(Edit::insert(at, block));
    }

    finish(text, edits, added)
}

/// Mark every class that uses undeclared properties with
/// `#[\AllowDynamicProperties]`. Classes already carrying it are skipped.
pub fn allow_dynamic_properties(text: &str, profile: &StyleProfile) -> Declared {
    let analysis = Analysis::new(text);
    let eol = profile.eol.as_str();
    let mut edits = Vec::new();
    let mut added = Vec::new();

    for facts in analysis.classes.iter().rev() {
        let region = &facts.region;
        if analysis.missing(facts).is_empty() || has_allow_attribute(text, region) {
            continue;
        }

        let header = &analysis.mask[region.decl_start..region.open_index];
        let keyword_at = class_keyword_pattern()
            .find(header)
            .map(|m| region.decl_start + m.start())
            .unwrap_or(region.decl_start);

        if text[region.decl_start..keyword_at].trim().is_empty() {
            let indent = leading_whitespace(text, region.decl_start);
            edits.push(Edit::insert(
                region.decl_start,
                format!("{indent}{ALLOW_ATTRIBUTE}{eol}"),
            ));
        } else {
            // Something else (an open tag) shares the line.
            edits.push(Edit::insert(keyword_at, format!("{ALLOW_ATTRIBUTE} ")));
        }
        added.push(region.name.clone());
    }

    finish(text, edits, added)
}

fn has_allow_attribute(text: &str, region: &ClassRegion) -> bool {
    if text[region.decl_start..region.open_index].contains("AllowDynamicProperties") {
        return true;
    }
    let mut end = region.decl_start;
    while end > 0 {
        let start = line_start(text, end - 1);
        let line = text[start..end].trim();
        if !line.starts_with("#[") {
            break;
        }
        if line.contains("AllowDynamicProperties") {
            return true;
        }
        end = start;
    }
    false
}

fn finish(text: &str, edits: Vec<Edit>, mut added: Vec<String>) -> Declared {
    if edits.is_empty() {
        return Declared::unchanged(text);
    }
    match apply_edits(text, edits) {
        Ok(new_text) => {
            // Edits were collected last region first; report in file order.
            added.reverse();
            Declared {
                text: new_text,
                added,
            }
        }
        Err(err) => {
            tracing::warn!("dropping property declarations: {err}");
            Declared::unchanged(text)
        }
    }
}
