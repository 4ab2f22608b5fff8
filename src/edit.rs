use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Byte-span replacement with verification.
///
/// Every structural change the patcher makes (property declarations,
/// attributes) is expressed as a list of these against the text that was
/// read, then spliced in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "Edit does nothing until applied"]
pub struct Edit {
    /// Starting byte offset (inclusive)
    pub byte_start: usize,
    /// Ending byte offset (exclusive)
    pub byte_end: usize,
    /// Replacement for [byte_start, byte_end)
    pub new_text: String,
    /// What the span must hold before the edit
    pub expected_before: EditVerification,
}

/// How to recognise the text an edit (or a write) expects to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditVerification {
    /// Exact text match required
    ExactMatch(String),
    /// xxh3 hash of the expected text
    Hash(u64),
}

impl EditVerification {
    pub fn matches(&self, text: &str) -> bool {
        self.matches_bytes(text.as_bytes())
    }

    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        match self {
            EditVerification::ExactMatch(expected) => bytes == expected.as_bytes(),
            EditVerification::Hash(expected_hash) => xxh3_64(bytes) == *expected_hash,
        }
    }

    /// Exact match for short text, hash above 1KB.
    pub fn from_text(text: &str) -> Self {
        if text.len() > 1024 {
            EditVerification::Hash(xxh3_64(text.as_bytes()))
        } else {
            EditVerification::ExactMatch(text.to_string())
        }
    }

    pub fn hash(&self) -> u64 {
        match self {
            EditVerification::Hash(h) => *h,
            EditVerification::ExactMatch(text) => xxh3_64(text.as_bytes()),
        }
    }
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("before-text verification failed at byte {byte_start}")]
    BeforeTextMismatch {
        byte_start: usize,
        byte_end: usize,
        expected: String,
        found: String,
    },

    #[error("invalid byte range [{byte_start}, {byte_end}) in text of length {len}")]
    InvalidByteRange {
        byte_start: usize,
        byte_end: usize,
        len: usize,
    },

    #[error("overlapping edits at byte {0}")]
    Overlap(usize),

    #[error("edit boundary splits a UTF-8 character at byte {0}")]
    InvalidUtf8Edit(usize),

    #[error("{} changed on disk since it was read", .0.display())]
    ModifiedOnDisk(PathBuf),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Edit {
    pub fn new(
        byte_start: usize,
        byte_end: usize,
        new_text: impl Into<String>,
        expected_before: impl AsRef<str>,
    ) -> Self {
        Self {
            byte_start,
            byte_end,
            new_text: new_text.into(),
            expected_before: EditVerification::from_text(expected_before.as_ref()),
        }
    }

    /// Pure insertion at `at`.
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::new(at, at, text, "")
    }

    fn validate(&self, content: &str) -> Result<(), EditError> {
        if self.byte_start > self.byte_end || self.byte_end > content.len() {
            return Err(EditError::InvalidByteRange {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                len: content.len(),
            });
        }
        for offset in [self.byte_start, self.byte_end] {
            if !content.is_char_boundary(offset) {
                return Err(EditError::InvalidUtf8Edit(offset));
            }
        }

        let current = &content[self.byte_start..self.byte_end];
        if !self.expected_before.matches(current) {
            return Err(EditError::BeforeTextMismatch {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                expected: format!("{:?}", self.expected_before),
                found: current.to_string(),
            });
        }
        Ok(())
    }
}

/// Apply `edits` to `source` and return the new text.
///
/// Edits are validated against the original text, checked for overlap, and
/// spliced bottom-to-top so earlier offsets stay valid. Two insertions at the
/// same offset keep their input order in the output.
pub fn apply_edits(source: &str, mut edits: Vec<Edit>) -> Result<String, EditError> {
    if edits.is_empty() {
        return Ok(source.to_string());
    }

    for edit in &edits {
        edit.validate(source)?;
    }

    // Stable sort, then reverse: descending by start, and same-offset
    // insertions end up spliced last-first, which preserves input order.
    edits.sort_by_key(|edit| edit.byte_start);
    edits.reverse();

    for window in edits.windows(2) {
        let (later, earlier) = (&window[0], &window[1]);
        if earlier.byte_end > later.byte_start {
            return Err(EditError::Overlap(later.byte_start));
        }
    }

    let mut out = source.to_string();
    for edit in &edits {
        out.replace_range(edit.byte_start..edit.byte_end, &edit.new_text);
    }
    Ok(out)
}

/// Replace the file at `path` with `content`, but only if what is on disk
/// still matches `expected`.
///
/// Guards against another writer touching the file between our read and our
/// write. The check and the rename are not one atomic step; callers that
/// need that serialize through their own lock.
pub fn write_verified(
    path: &Path,
    expected: &EditVerification,
    content: &[u8],
) -> Result<(), EditError> {
    let on_disk = fs::read(path)?;
    if !expected.matches_bytes(&on_disk) {
        return Err(EditError::ModifiedOnDisk(path.to_path_buf()));
    }
    atomic_write(path, content)
}

/// Atomic file write: tempfile + fsync + rename, then bump mtime so opcode
/// caches notice the change.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), EditError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(EditError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no parent directory",
            )))
        }
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;

    // Keep the original permission bits; NamedTempFile creates 0600.
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(temp.path(), meta.permissions())?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    filetime::set_file_mtime(path, filetime::FileTime::now())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_verification_exact_match() {
        let verify = EditVerification::ExactMatch("hello world".to_string());
        assert!(verify.matches("hello world"));
        assert!(!verify.matches("hello"));
    }

    #[test]
    fn test_edit_verification_hash() {
        let verify = EditVerification::Hash(xxh3_64(b"hello world"));
        assert!(verify.matches("hello world"));
        assert!(!verify.matches("goodbye world"));
    }

    #[test]
    fn test_edit_verification_from_text_threshold() {
        assert!(matches!(EditVerification::from_text("small"), EditVerification::ExactMatch(_)));
        let large = "x".repeat(2000);
        let verify = EditVerification::from_text(&large);
        assert!(matches!(verify, EditVerification::Hash(_)));
        assert!(verify.matches(&large));
    }

    #[test]
    fn test_invalid_range() {
        let result = apply_edits("hello world", vec![Edit::new(5, 20, "x", "")]);
        assert!(matches!(result, Err(EditError::InvalidByteRange { .. })));
        let result = apply_edits("hello world", vec![Edit::new(10, 5, "x", "")]);
        assert!(matches!(result, Err(EditError::InvalidByteRange { .. })));
    }

    #[test]
    fn test_before_text_mismatch() {
        let result = apply_edits("hello world", vec![Edit::new(0, 5, "HELLO", "howdy")]);
        assert!(matches!(result, Err(EditError::BeforeTextMismatch { .. })));
    }

    #[test]
    fn test_char_boundary_rejected() {
        let result = apply_edits("日本", vec![Edit::insert(1, "x")]);
        assert!(matches!(result, Err(EditError::InvalidUtf8Edit(1))));
    }

    #[test]
    fn test_batch_applies_bottom_up() {
        let source = "line1\nline2\nline3\n";
        let edits = vec![
            Edit::new(0, 5, "LINE1", "line1"),
            Edit::new(12, 17, "LINE3", "line3"),
            Edit::new(6, 11, "LINE2", "line2"),
        ];
        assert_eq!(apply_edits(source, edits).unwrap(), "LINE1\nLINE2\nLINE3\n");
    }

    #[test]
    fn test_same_offset_insertions_keep_order() {
        let edits = vec![Edit::insert(1, "b"), Edit::insert(1, "c")];
        assert_eq!(apply_edits("ad", edits).unwrap(), "abcd");
    }

    #[test]
    fn test_overlap_rejected() {
        let edits = vec![Edit::new(0, 5, "x", "hello"), Edit::new(3, 8, "y", "lo wo")];
        assert!(matches!(apply_edits("hello world", edits), Err(EditError::Overlap(_))));
    }

    #[test]
    fn test_atomic_write_integration() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test.php");
        fs::write(&file_path, b"original content").unwrap();

        atomic_write(&file_path, b"modified content").unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "modified content");
    }

    #[test]
    fn test_write_verified_detects_concurrent_change() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test.php");
        fs::write(&file_path, b"<?php echo 1;").unwrap();
        let expected = EditVerification::from_text("<?php echo 1;");

        fs::write(&file_path, b"<?php echo 2;").unwrap();
        let result = write_verified(&file_path, &expected, b"<?php echo 3;");
        assert!(matches!(result, Err(EditError::ModifiedOnDisk(_))));
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "<?php echo 2;");

        let expected = EditVerification::from_text("<?php echo 2;");
        write_verified(&file_path, &expected, b"<?php echo 3;").unwrap();
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "<?php echo 3;");
    }
}
