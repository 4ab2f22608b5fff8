//! Rewriting paths recorded on another filesystem root (a container, a
//! production host) into paths that resolve locally.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

/// Environment variable holding a JSON list of `{"from": ..., "to": ...}`.
pub const PATH_MAPS_ENV: &str = "PATH_MAPS";

/// One prefix rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
}

impl PathMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// An immutable set of mappings, most specific (longest `from`) first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMap {
    mappings: Vec<PathMapping>,
}

impl PathMap {
    /// Build a map. Entries with an empty side are dropped; the rest are
    /// ordered by descending `from` length, keeping input order among equals.
    pub fn new(mappings: impl IntoIterator<Item = PathMapping>) -> Self {
        let mut mappings: Vec<PathMapping> = mappings
            .into_iter()
            .filter(|m| !trim_separators(&m.from).is_empty() && !m.to.trim().is_empty())
            .collect();
        mappings.sort_by_key(|m| std::cmp::Reverse(trim_separators(&m.from).len()));
        Self { mappings }
    }

    /// Parse a JSON list of mappings.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mappings: Vec<PathMapping> = serde_json::from_str(json)?;
        Ok(Self::new(mappings))
    }

    /// Read [`PATH_MAPS_ENV`]. Absent or malformed yields the identity map.
    pub fn from_env() -> Self {
        match env::var(PATH_MAPS_ENV) {
            Ok(json) if !json.trim().is_empty() => Self::from_json(&json).unwrap_or_else(|err| {
                tracing::warn!("ignoring malformed {PATH_MAPS_ENV}: {err}");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// A new map holding both sets of mappings.
    #[must_use]
    pub fn merged(&self, other: &PathMap) -> Self {
        Self::new(
            self.mappings
                .iter()
                .chain(other.mappings.iter())
                .cloned(),
        )
    }

    pub fn mappings(&self) -> &[PathMapping] {
        &self.mappings
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Rewrite `path` with the most specific mapping whose `from` is a prefix
    /// of it on a component boundary. Unmatched paths come back normalized to
    /// the local separator convention.
    pub fn remap(&self, path: &str) -> PathBuf {
        let unified = path.replace('\\', "/");

        for mapping in &self.mappings {
            let from = trim_separators(&mapping.from).replace('\\', "/");
            let Some(tail) = unified.strip_prefix(from.as_str()) else {
                continue;
            };
            if !(tail.is_empty() || tail.starts_with('/')) {
                continue;
            }
            let to = mapping.to.trim_end_matches(['/', '\\']);
            let remapped = format!("{to}{}", to_local(tail));
            tracing::debug!(from = %mapping.from, to = %mapping.to, "remapped {path}");
            return normalize_path(Path::new(&remapped));
        }

        normalize_path(Path::new(&to_local(path)))
    }
}

fn trim_separators(s: &str) -> &str {
    s.trim().trim_end_matches(['/', '\\'])
}

/// Convert both separator styles to the platform's own.
pub fn to_local(path: &str) -> String {
    if MAIN_SEPARATOR == '/' {
        path.replace('\\', "/")
    } else {
        path.replace('/', "\\")
    }
}

/// Lexically resolve `.` and `..` and collapse repeated separators without
/// touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
