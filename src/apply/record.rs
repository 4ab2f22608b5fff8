use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

/// A pipeline stage that can change a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Rules,
    Coalesce,
    DynDeclare,
    DynAttribute,
    Llm,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Rules => "rules",
            Stage::Coalesce => "coalesce",
            Stage::DynDeclare => "dyn_declare",
            Stage::DynAttribute => "dyn_attribute",
            Stage::Llm => "llm",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a file was (or was not) patched. Serializes as a single string such
/// as `rules+dyn_declare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchMethod {
    Applied(Vec<Stage>),
    None,
    Skip,
}

impl PatchMethod {
    pub fn stages(&self) -> &[Stage] {
        match self {
            PatchMethod::Applied(stages) => stages,
            _ => &[],
        }
    }
}

impl fmt::Display for PatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchMethod::Applied(stages) if !stages.is_empty() => {
                for (idx, stage) in stages.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("+")?;
                    }
                    f.write_str(stage.as_str())?;
                }
                Ok(())
            }
            PatchMethod::Applied(_) | PatchMethod::None => f.write_str("none"),
            PatchMethod::Skip => f.write_str("skip"),
        }
    }
}

impl Serialize for PatchMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome for one file; the audit trail of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub file: PathBuf,
    /// True only when the file on disk now differs from before the run
    pub changed: bool,
    pub method: PatchMethod,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reverted: bool,
}

impl PatchRecord {
    pub fn skipped(file: impl Into<PathBuf>, note: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            changed: false,
            method: PatchMethod::Skip,
            note: note.into(),
            backup: None,
            reverted: false,
        }
    }

    pub fn unchanged(file: impl Into<PathBuf>, note: impl Into<String>) -> Self {
        Self {
            method: PatchMethod::None,
            ..Self::skipped(file, note)
        }
    }

    /// The record for evidence that named no file at all.
    pub fn no_targets() -> Self {
        Self::unchanged(PathBuf::new(), "no_targets")
    }

    /// Whether this record should count as a failure in a run summary.
    pub fn is_failure(&self) -> bool {
        self.reverted
            || self.method == PatchMethod::Skip
            || self.note.contains("write_error")
            || self.note.contains("modified_during_patch")
            || self.note.contains("revert_failed")
    }
}
