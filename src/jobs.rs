//! Registry of long-running fix jobs.
//!
//! A job accumulates evidence page by page (which files and lines errored,
//! plus a few raw snippets for context), then patches a confirmed subset of
//! its targets on a worker thread. Every access goes through the job's own
//! mutex; the map itself is a [`DashMap`] so unrelated jobs never contend.

use crate::apply::{FileTarget, PatchApplier, PatchRecord};
use crate::locate::extract_targets;
use crate::remap::PathMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use uuid::Uuid;

/// Evidence snippets kept per job.
pub const CONTEXT_SNIPPETS: usize = 5;
/// Characters kept from each snippet.
pub const SNIPPET_LIMIT: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub passed: usize,
    pub failed: usize,
}

/// Everything seen so far for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetEvidence {
    pub lines: BTreeSet<u32>,
    /// Number of reports naming this file, duplicates included
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub project_root: PathBuf,
    pub status: JobStatus,
    pub progress: usize,
    pub total: usize,
    pub summary: PageSummary,
    pub targets: BTreeMap<PathBuf, TargetEvidence>,
    /// Reports per `file.php:line` label
    pub errors_by_file: BTreeMap<String, usize>,
    /// New targets arrived since the last fix
    pub needs_confirmation: bool,
    pub context: VecDeque<String>,
    pub fixes: Vec<PatchRecord>,
}

impl Job {
    fn new(id: JobId, project_root: PathBuf, total: usize) -> Self {
        Self {
            id,
            project_root,
            status: JobStatus::Queued,
            progress: 0,
            total,
            summary: PageSummary::default(),
            targets: BTreeMap::new(),
            errors_by_file: BTreeMap::new(),
            needs_confirmation: false,
            context: VecDeque::new(),
            fixes: Vec::new(),
        }
    }

    /// Kept snippets, oldest first, separated by blank lines.
    pub fn context_text(&self) -> String {
        self.context
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn push_context(&mut self, evidence: &str) {
        if self.context.len() == CONTEXT_SNIPPETS {
            self.context.pop_front();
        }
        self.context
            .push_back(evidence.chars().take(SNIPPET_LIMIT).collect());
    }
}

/// `name.php:12` for a report against `path`.
fn error_label(path: &Path, line: u32) -> String {
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    format!("{name}:{line}")
}

/// One row of [`JobStore::targets`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSummary {
    pub file: PathBuf,
    pub lines: Vec<u32>,
    pub count: usize,
    pub exists: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("none of the requested files are known targets of this job")]
    NoValidItems,
}

/// Shared job registry. Clones refer to the same jobs.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<DashMap<JobId, Arc<Mutex<Job>>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queued job over `total` pages rooted at `project_root`.
    pub fn create(&self, project_root: impl Into<PathBuf>, total: usize) -> JobId {
        let id = JobId::new();
        let job = Job::new(id, project_root.into(), total);
        self.jobs.insert(id, Arc::new(Mutex::new(job)));
        tracing::debug!(job = %id, total, "job created");
        id
    }

    /// Snapshot of the job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.handle(id).ok().map(|job| job.lock().clone())
    }

    /// Run `f` with the job locked.
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Result<R, JobError> {
        let job = self.handle(id)?;
        let mut guard = job.lock();
        Ok(f(&mut *guard))
    }

    pub fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), JobError> {
        if let JobStatus::Error(message) = &status {
            tracing::warn!(job = %id, "job failed: {message}");
        }
        self.update(id, |job| job.status = status)
    }

    /// Count one checked page.
    pub fn record_page(&self, id: JobId, passed: bool) -> Result<(), JobError> {
        self.update(id, |job| {
            job.progress += 1;
            if passed {
                job.summary.passed += 1;
            } else {
                job.summary.failed += 1;
            }
        })
    }

    /// Fold the targets named by `evidence` into the job. Returns how many
    /// targets it named; evidence naming none is not kept as context.
    pub fn record_evidence(&self, id: JobId, evidence: &str, map: &PathMap) -> Result<usize, JobError> {
        let found = extract_targets(evidence);
        self.update(id, |job| {
            if found.is_empty() {
                return 0;
            }
            for target in &found {
                let path = target.resolve(&job.project_root, map);
                *job.errors_by_file.entry(error_label(&path, target.line)).or_default() += 1;
                let entry = job.targets.entry(path).or_default();
                entry.lines.insert(target.line);
                entry.count += 1;
            }
            job.push_context(evidence);
            job.needs_confirmation = true;
            found.len()
        })
    }

    pub fn targets(&self, id: JobId) -> Result<Vec<TargetSummary>, JobError> {
        let snapshot: Vec<(PathBuf, TargetEvidence)> = self.update(id, |job| {
            job.targets
                .iter()
                .map(|(path, evidence)| (path.clone(), evidence.clone()))
                .collect()
        })?;
        Ok(snapshot
            .into_iter()
            .map(|(file, evidence)| TargetSummary {
                exists: file.exists(),
                lines: evidence.lines.into_iter().collect(),
                count: evidence.count,
                file,
            })
            .collect())
    }

    /// Patch the requested files that are known targets of the job on a
    /// worker thread, using the job's kept snippets as evidence.
    pub fn spawn_fix(
        &self,
        id: JobId,
        items: Vec<FileTarget>,
        applier: PatchApplier,
    ) -> Result<JoinHandle<Vec<PatchRecord>>, JobError> {
        let (items, context) = self.update(id, |job| {
            let items: Vec<FileTarget> = items
                .into_iter()
                .filter(|item| job.targets.contains_key(&item.path))
                .collect();
            (items, job.context_text())
        })?;
        if items.is_empty() {
            return Err(JobError::NoValidItems);
        }

        tracing::info!(job = %id, files = items.len(), "starting fix");
        let store = self.clone();
        Ok(thread::spawn(move || {
            let records = applier.fix_targets(&items, &context);
            let stored = store.update(id, |job| {
                job.fixes.extend(records.iter().cloned());
                job.needs_confirmation = false;
            });
            if stored.is_err() {
                tracing::warn!(job = %id, "job removed before its fix finished");
            }
            records
        }))
    }

    pub fn remove(&self, id: JobId) -> Option<Job> {
        self.jobs
            .remove(&id)
            .map(|(_, job)| job.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn handle(&self, id: JobId) -> Result<Arc<Mutex<Job>>, JobError> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(JobError::NotFound(id))
    }
}
