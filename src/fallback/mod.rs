//! Handing files no deterministic stage could fix to a text-completion
//! collaborator.
//!
//! The collaborator is treated as unreliable: its answer is accepted only
//! when it is a non-empty full file that differs from the input, and any
//! failure (error or panic) becomes an `llm:error:{kind}` outcome instead of
//! propagating.

pub mod http;

use crate::style::StyleProfile;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

pub use http::HttpCompleter;

/// Lines of context on each side of a reported error line.
pub const CONTEXT_RADIUS: u32 = 2;

/// Evidence beyond this many characters is cut before it goes in a prompt.
pub const EVIDENCE_LIMIT: usize = 1800;

pub const SYSTEM_INSTRUCTIONS: &str = "\
You are a precise PHP 8 migration editor that outputs only code.
Fix the runtime errors described below without changing behavior.
- Prefer ?? and isset() guards and PHP 8 safe APIs.
- Declare missing class properties instead of adding attributes.
- Do not invent functions. Do not refactor or reformat unrelated code.
- Match the file's existing style.
Return ONLY the full corrected file content.";

/// Everything the collaborator gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system_instructions: String,
    pub file_path: String,
    pub style_hint: String,
    pub error_context: String,
    pub original_content: String,
}

impl CompletionRequest {
    /// Build a request for `text` with windows around `lines` and the
    /// (truncated) evidence.
    pub fn new(
        file_path: impl Into<String>,
        text: &str,
        lines: &BTreeSet<u32>,
        evidence: &str,
        profile: &StyleProfile,
    ) -> Self {
        let mut error_context = context_window(text, lines);
        let evidence = truncate_chars(evidence.trim(), EVIDENCE_LIMIT);
        if !evidence.is_empty() {
            if !error_context.is_empty() {
                error_context.push('\n');
            }
            error_context.push_str("--- evidence ---\n");
            error_context.push_str(evidence);
        }

        Self {
            system_instructions: SYSTEM_INSTRUCTIONS.to_string(),
            file_path: file_path.into(),
            style_hint: profile.hint(),
            error_context,
            original_content: text.to_string(),
        }
    }

    /// The user turn sent alongside [`CompletionRequest::system_instructions`].
    pub fn user_prompt(&self) -> String {
        format!(
            "=== FILE PATH ===\n{}\n\n=== STYLE ===\n{}\n\n=== ERROR CONTEXT ===\n{}\n\n=== ORIGINAL FILE CONTENT ===\n```php\n{}\n```\n",
            self.file_path, self.style_hint, self.error_context, self.original_content
        )
    }
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("completion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed completion response: {0}")]
    Malformed(String),
}

impl CompletionError {
    /// Short tag used in record notes.
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::MissingApiKey => "missing_api_key",
            CompletionError::Timeout => "timeout",
            CompletionError::Transport(_) => "transport",
            CompletionError::Status { .. } => "status",
            CompletionError::Malformed(_) => "malformed_response",
        }
    }
}

/// A text-completion collaborator: given a request, the full replacement
/// file content.
pub trait Completer: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// What the fallback produced for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    Patched(String),
    NoChange,
    Failed(String),
}

impl FallbackOutcome {
    pub fn note(&self) -> String {
        match self {
            FallbackOutcome::Patched(_) => "llm".to_string(),
            FallbackOutcome::NoChange => "llm:no_change".to_string(),
            FallbackOutcome::Failed(kind) => format!("llm:error:{kind}"),
        }
    }
}

/// Ask `completer` for a fixed version of the request's file.
pub fn request_fix(completer: &dyn Completer, request: &CompletionRequest) -> FallbackOutcome {
    let response = panic::catch_unwind(AssertUnwindSafe(|| completer.complete(request)));
    match response {
        Ok(Ok(response)) => {
            let fixed = normalize_response(&response, &request.original_content);
            if fixed.trim().is_empty() || fixed == request.original_content {
                tracing::debug!(file = %request.file_path, "completer returned no change");
                FallbackOutcome::NoChange
            } else {
                FallbackOutcome::Patched(fixed)
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(file = %request.file_path, "completer failed: {err}");
            FallbackOutcome::Failed(err.kind().to_string())
        }
        Err(_) => {
            tracing::warn!(file = %request.file_path, "completer panicked");
            FallbackOutcome::Failed("panic".to_string())
        }
    }
}

/// Strip a Markdown code fence if present, then give the text the same
/// trailing line ending as the original.
pub fn normalize_response(response: &str, original: &str) -> String {
    let body = strip_fences(response).trim();
    if body.is_empty() {
        return String::new();
    }

    let mut fixed = body.to_string();
    let trailing = if original.ends_with("\r\n") {
        "\r\n"
    } else if original.ends_with('\n') {
        "\n"
    } else {
        ""
    };
    fixed.push_str(trailing);
    fixed
}

/// Inner text of the first fenced block, or the whole response.
pub fn strip_fences(response: &str) -> &str {
    let Some(open) = response.find("```") else {
        return response;
    };
    let after_open = &response[open + 3..];
    // Language tag runs to the end of the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];
    match body.rfind("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Numbered lines within [`CONTEXT_RADIUS`] of each error line, with
/// overlapping windows merged and gaps marked.
pub fn context_window(text: &str, lines: &BTreeSet<u32>) -> String {
    let source_lines: Vec<&str> = text.lines().collect();
    let total = source_lines.len() as u32;
    if total == 0 {
        return String::new();
    }

    let mut windows: Vec<(u32, u32)> = Vec::new();
    for &line in lines.iter().filter(|&&l| l >= 1 && l <= total) {
        let start = line.saturating_sub(CONTEXT_RADIUS).max(1);
        let end = (line + CONTEXT_RADIUS).min(total);
        match windows.last_mut() {
            Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
            _ => windows.push((start, end)),
        }
    }

    let width = total.to_string().len();
    let mut out = String::new();
    for (i, (start, end)) in windows.iter().enumerate() {
        if i > 0 {
            out.push_str("...\n");
        }
        for n in *start..=*end {
            let marker = if lines.contains(&n) { '>' } else { ' ' };
            let content = source_lines[(n - 1) as usize];
            out.push_str(&format!("{marker}{n:>width$} | {content}\n"));
        }
    }
    out
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
