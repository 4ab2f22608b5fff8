//! The per-file patch pipeline.
//!
//! For each file named by the evidence the applier runs, in order: the rule
//! engine, the undefined-key coalescer, the dynamic-property declarator and,
//! only when none of those changed anything, the generative fallback. A
//! changed file is backed up (once), written atomically, and validated; a
//! file that fails validation is restored byte-for-byte.
//!
//! # Example
//!
//! ```no_run
//! use php_patcher::apply::PatchApplier;
//! use php_patcher::remap::PathMap;
//! use std::path::Path;
//!
//! let evidence = "Warning: Undefined array key \"id\" in /srv/app/view.php on line 4";
//! let applier = PatchApplier::new(Vec::new());
//! for record in applier.fix_evidence(evidence, Path::new("/srv/app"), &PathMap::default()) {
//!     println!("{} {} {}", record.file.display(), record.method, record.note);
//! }
//! ```

mod locks;
mod record;

pub use locks::FileLocks;
pub use record::{PatchMethod, PatchRecord, Stage};

use crate::coalesce::coalesce_undefined_keys;
use crate::declare::{fix_dynamic_properties, DynPropsMode};
use crate::edit::{atomic_write, write_verified, EditError, EditVerification};
use crate::fallback::{request_fix, CompletionRequest, Completer, FallbackOutcome};
use crate::locate::extract_targets;
use crate::remap::PathMap;
use crate::rules::{apply_rules, Rule};
use crate::style::StyleProfile;
use crate::validate::Validator;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// One file and every error line reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    pub path: PathBuf,
    pub lines: BTreeSet<u32>,
}

impl FileTarget {
    pub fn new(path: impl Into<PathBuf>, lines: impl IntoIterator<Item = u32>) -> Self {
        Self {
            path: path.into(),
            lines: lines.into_iter().collect(),
        }
    }
}

/// Group `(path, line)` pairs by file, keeping the order files first appear.
pub fn group_targets(targets: impl IntoIterator<Item = (PathBuf, u32)>) -> Vec<FileTarget> {
    let mut grouped: Vec<FileTarget> = Vec::new();
    for (path, line) in targets {
        match grouped.iter_mut().find(|t| t.path == path) {
            Some(existing) => {
                existing.lines.insert(line);
            }
            None => grouped.push(FileTarget::new(path, [line])),
        }
    }
    grouped
}

/// The files named by `evidence`, resolved under `root`, one entry per file.
pub fn file_targets(evidence: &str, root: &Path, map: &PathMap) -> Vec<FileTarget> {
    group_targets(
        extract_targets(evidence)
            .iter()
            .map(|target| (target.resolve(root, map), target.line)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixOptions {
    pub dynprops: DynPropsMode,
    /// Ask the completer when no deterministic stage changed the file
    pub use_fallback: bool,
    /// Run the validator after each write
    pub validate: bool,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            dynprops: DynPropsMode::Declare,
            use_fallback: false,
            validate: true,
        }
    }
}

/// The computed result for one file, before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub original: String,
    pub text: String,
    /// Stages that changed the text, in the order they ran
    pub stages: Vec<Stage>,
    pub notes: Vec<String>,
}

impl Plan {
    pub fn changed(&self) -> bool {
        self.text != self.original
    }

    pub fn method(&self) -> PatchMethod {
        if self.stages.is_empty() {
            PatchMethod::None
        } else {
            PatchMethod::Applied(self.stages.clone())
        }
    }

    pub fn note(&self) -> String {
        if self.notes.is_empty() {
            "no_change".to_string()
        } else {
            self.notes.join(" ; ")
        }
    }
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid UTF-8", .0.display())]
    NotUtf8(PathBuf),

    #[error("failed to create backup {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: EditError,
    },

    #[error("{} changed on disk while it was being patched", .0.display())]
    ModifiedDuringPatch(PathBuf),
}

impl PatchError {
    /// Tag recorded in [`PatchRecord::note`].
    pub fn note(&self) -> String {
        match self {
            PatchError::NotFound(_) => "not_found".to_string(),
            PatchError::Read { source, .. } => format!("read_error:{source}"),
            PatchError::NotUtf8(_) => "read_error:not_utf8".to_string(),
            PatchError::Backup { source, .. } => format!("write_error:backup:{source}"),
            PatchError::Write { source, .. } => format!("write_error:{source}"),
            PatchError::ModifiedDuringPatch(_) => "modified_during_patch".to_string(),
        }
    }
}

/// Backup location for `path`: the same name with `.bak` appended.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

/// Runs the stage pipeline over files. Cheap to clone; clones share locks.
#[derive(Clone, Default)]
pub struct PatchApplier {
    rules: Arc<Vec<Rule>>,
    options: FixOptions,
    completer: Option<Arc<dyn Completer>>,
    validator: Option<Arc<dyn Validator>>,
    locks: FileLocks,
}

impl PatchApplier {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Arc::new(rules),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: FixOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_completer(mut self, completer: Arc<dyn Completer>) -> Self {
        self.completer = Some(completer);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Share `locks` with other appliers patching the same tree.
    #[must_use]
    pub fn with_locks(mut self, locks: FileLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn options(&self) -> &FixOptions {
        &self.options
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn locks(&self) -> &FileLocks {
        &self.locks
    }

    /// Locate every target in `evidence`, resolve it under `root`, and fix
    /// each distinct file once.
    pub fn fix_evidence(&self, evidence: &str, root: &Path, map: &PathMap) -> Vec<PatchRecord> {
        let targets = file_targets(evidence, root, map);
        if targets.is_empty() {
            tracing::debug!("evidence names no targets");
            return vec![PatchRecord::no_targets()];
        }
        self.fix_targets(&targets, evidence)
    }

    /// Fix each file in order. A failure in one never stops the next.
    pub fn fix_targets(&self, targets: &[FileTarget], evidence: &str) -> Vec<PatchRecord> {
        targets
            .iter()
            .map(|target| self.fix_file(target, evidence))
            .collect()
    }

    pub fn fix_file(&self, target: &FileTarget, evidence: &str) -> PatchRecord {
        self.locks.with_lock(&target.path, || match self.try_fix(target, evidence) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(file = %target.path.display(), "{error}");
                PatchRecord::skipped(&target.path, error.note())
            }
        })
    }

    /// Compute what [`PatchApplier::fix_file`] would write, without writing.
    pub fn plan_file(
        &self,
        path: &Path,
        lines: &BTreeSet<u32>,
        evidence: &str,
    ) -> Result<Plan, PatchError> {
        let (_, original) = read_source(path)?;
        Ok(self.plan_text(path, original, lines, evidence))
    }

    fn try_fix(&self, target: &FileTarget, evidence: &str) -> Result<PatchRecord, PatchError> {
        let path = target.path.as_path();
        let (bytes, original) = read_source(path)?;
        let plan = self.plan_text(path, original, &target.lines, evidence);

        if !plan.changed() {
            return Ok(PatchRecord::unchanged(path, plan.note()));
        }

        let backup = ensure_backup(path, &bytes)?;
        let expected = EditVerification::from_text(&plan.original);
        write_verified(path, &expected, plan.text.as_bytes()).map_err(|source| match source {
            EditError::ModifiedOnDisk(path) => PatchError::ModifiedDuringPatch(path),
            source => PatchError::Write {
                path: path.to_path_buf(),
                source,
            },
        })?;
        tracing::info!(file = %path.display(), method = %plan.method(), "patched");

        let mut record = PatchRecord {
            file: path.to_path_buf(),
            changed: true,
            method: plan.method(),
            note: String::new(),
            backup: Some(backup),
            reverted: false,
        };
        let mut notes = plan.notes;

        if self.options.validate {
            if let Some(validator) = &self.validator {
                match validator.validate(path) {
                    Ok(report) if report.passed => {}
                    Ok(report) => {
                        tracing::warn!(
                            file = %path.display(),
                            "validation failed, restoring: {}",
                            report.summary()
                        );
                        notes.push(format!("validation_failed:{}", report.summary()));
                        match atomic_write(path, &bytes) {
                            Ok(()) => {
                                record.changed = false;
                                record.reverted = true;
                            }
                            Err(error) => {
                                // The patched bytes are still on disk.
                                tracing::error!(file = %path.display(), "restore failed: {error}");
                                notes.push(format!("revert_failed:{error}"));
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(file = %path.display(), "validator unavailable: {error}");
                        notes.push("lint_unavailable".to_string());
                    }
                }
            }
        }

        record.note = notes.join(" ; ");
        Ok(record)
    }

    fn plan_text(
        &self,
        path: &Path,
        original: String,
        lines: &BTreeSet<u32>,
        evidence: &str,
    ) -> Plan {
        let mut text = original.clone();
        let mut stages = Vec::new();
        let mut notes = Vec::new();

        if !self.rules.is_empty() {
            let outcome = apply_rules(&self.rules, &text, evidence);
            tracing::debug!(file = %path.display(), changed = outcome.changed, "rules");
            notes.extend(outcome.notes);
            if outcome.changed {
                stages.push(Stage::Rules);
                text = outcome.text;
            }
        }

        let coalesced = coalesce_undefined_keys(&text, evidence);
        if coalesced.changed() {
            tracing::debug!(file = %path.display(), keys = coalesced.wrapped.len(), "coalesce");
            stages.push(Stage::Coalesce);
            notes.push(coalesced.note());
            text = coalesced.text;
        }

        let profile = StyleProfile::infer(&text);
        let declared = fix_dynamic_properties(&text, &profile, self.options.dynprops);
        if declared.changed() {
            let stage = match self.options.dynprops {
                DynPropsMode::Attribute => Stage::DynAttribute,
                _ => Stage::DynDeclare,
            };
            tracing::debug!(file = %path.display(), added = declared.added.len(), "{stage}");
            notes.push(format!("{stage}:{}", declared.added.join(",")));
            stages.push(stage);
            text = declared.text;
        }

        if stages.is_empty() && self.options.use_fallback {
            if let Some(completer) = &self.completer {
                let request = CompletionRequest::new(
                    path.display().to_string(),
                    &text,
                    lines,
                    evidence,
                    &profile,
                );
                let outcome = request_fix(completer.as_ref(), &request);
                notes.push(outcome.note());
                if let FallbackOutcome::Patched(patched) = outcome {
                    stages.push(Stage::Llm);
                    text = patched;
                }
            }
        }

        Plan {
            original,
            text,
            stages,
            notes,
        }
    }
}

fn read_source(path: &Path) -> Result<(Vec<u8>, String), PatchError> {
    let bytes = fs::read(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => PatchError::NotFound(path.to_path_buf()),
        _ => PatchError::Read {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let text = String::from_utf8(bytes.clone()).map_err(|_| PatchError::NotUtf8(path.to_path_buf()))?;
    Ok((bytes, text))
}

/// Write `original` to the backup path unless a backup already exists.
fn ensure_backup(path: &Path, original: &[u8]) -> Result<PathBuf, PatchError> {
    let backup = backup_path(path);
    let created = OpenOptions::new().write(true).create_new(true).open(&backup);
    match created {
        Ok(mut file) => {
            file.write_all(original)
                .and_then(|_| file.sync_all())
                .map_err(|source| PatchError::Backup {
                    path: backup.clone(),
                    source,
                })?;
            tracing::debug!(backup = %backup.display(), "backup created");
        }
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(PatchError::Backup {
                path: backup,
                source,
            })
        }
    }
    Ok(backup)
}
