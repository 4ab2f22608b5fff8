use crate::remap::normalize_path;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One mutex per file, shared by every applier cloned from the same set.
///
/// Keys are canonical paths when the file exists, so `a/../b.php` and
/// `b.php` contend on the same lock. An entry lives only while someone
/// holds or waits on its lock.
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    inner: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `path`. Hold its guard for the whole
    /// read-modify-write of the file, then [`FileLocks::release`] it.
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.lock_key_for(lock_key(path))
    }

    /// Run `f` while holding the lock for `path`, dropping the map entry
    /// afterwards if no other caller holds it.
    pub fn with_lock<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let key = lock_key(path);
        let lock = self.lock_key_for(key.clone());
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.release_key(&key);
        result
    }

    /// Forget the lock for `path` unless a caller still holds a handle.
    pub fn release(&self, path: &Path) {
        self.release_key(&lock_key(path));
    }

    /// Number of files currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn lock_key_for(&self, key: PathBuf) -> Arc<Mutex<()>> {
        self.inner.entry(key).or_default().value().clone()
    }

    fn release_key(&self, key: &Path) {
        // The shard stays write-locked during the check, so no new handle
        // can be cloned out between the count and the removal.
        self.inner.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn lock_key(path: &Path) -> PathBuf {
    path.canonicalize()
        .unwrap_or_else(|_| normalize_path(path))
}
